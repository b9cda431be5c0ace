use std::path::Path;
use std::time::Duration;

use heapwatch::agent::{Agent, AgentError};
use heapwatch::config::AgentConfig;
use heapwatch::engine::sim::{HomeLoop, SimEngine};

const PERIOD_MS: u64 = 300;

fn snapshot_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".heapsnapshot"))
        .collect();
    names.sort();
    names
}

fn agent_config(dir: &Path) -> AgentConfig {
    AgentConfig {
        period_ms: PERIOD_MS,
        destination_dir: dir.to_path_buf(),
        ..AgentConfig::default()
    }
}

fn home_loop() -> HomeLoop {
    HomeLoop::new(SimEngine::new(256 * 1024 * 1024, 4096), Duration::from_millis(5))
        .expect("home loop needs a tokio runtime")
}

#[tokio::test]
async fn first_tick_writes_one_snapshot_and_disable_stops_further_ones() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));

    agent.enable().unwrap();
    home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
    agent.disable().unwrap();
    home.run_for(Duration::from_millis(50)).await;

    let pid = std::process::id();
    assert_eq!(snapshot_files(dir.path()), vec![format!("{pid}.0.heapsnapshot")]);
    let stats = agent.stats();
    assert_eq!(stats.snapshots_taken, 1);
    assert_eq!(stats.next_snapshot_number, 1);
    assert_eq!(stats.timeline_len, 1);
    assert!(!stats.enabled);

    home.run_for(Duration::from_millis(PERIOD_MS * 2)).await;
    assert_eq!(snapshot_files(dir.path()).len(), 1);
    assert_eq!(agent.stats().snapshots_taken, 1);
}

#[tokio::test]
async fn each_request_is_released_after_both_paths_report() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));

    agent.enable().unwrap();
    home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
    agent.disable().unwrap();

    let mut stats = agent.stats();
    for _ in 0..100 {
        home.run_for(Duration::from_millis(10)).await;
        stats = agent.stats();
        if stats.requests_released == stats.requests_armed {
            break;
        }
    }
    assert_eq!(stats.requests_armed, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(stats.snapshots_taken, 1);
}

#[tokio::test]
async fn snapshots_follow_the_timer_period() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let config = AgentConfig {
        period_ms: 100,
        ..agent_config(dir.path())
    };
    let agent = Agent::new(home.scheduler(), &config);

    agent.enable().unwrap();
    home.run_for(Duration::from_millis(350)).await;
    agent.disable().unwrap();
    home.run_for(Duration::from_millis(50)).await;

    let taken = agent.stats().snapshots_taken;
    assert!(taken >= 2, "expected several snapshots, got {taken}");
    let pid = std::process::id();
    let files = snapshot_files(dir.path());
    assert_eq!(files.len() as u64, taken);
    for sequence in 0..taken {
        assert!(files.contains(&format!("{pid}.{sequence}.heapsnapshot")));
    }
}

#[tokio::test]
async fn enable_and_disable_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));

    agent.disable().unwrap();
    assert!(!agent.is_enabled());

    agent.enable().unwrap();
    agent.enable().unwrap();
    assert!(agent.is_enabled());

    home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
    assert_eq!(agent.stats().ticks, 1);

    agent.disable().unwrap();
    agent.disable().unwrap();
    assert!(!agent.is_enabled());
}

#[tokio::test]
async fn agent_can_be_reenabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));

    for _ in 0..2 {
        agent.enable().unwrap();
        home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
        agent.disable().unwrap();
        home.run_for(Duration::from_millis(20)).await;
    }

    let pid = std::process::id();
    assert_eq!(
        snapshot_files(dir.path()),
        vec![
            format!("{pid}.0.heapsnapshot"),
            format!("{pid}.1.heapsnapshot")
        ]
    );
}

#[tokio::test]
async fn lookups_fail_until_a_snapshot_assigns_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));
    let handle = home.engine_mut().allocate("session".to_string(), 512);

    for id in [0, -5] {
        let err = agent.get_object_by_snapshot_id(home.engine(), id).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }
    let err = agent.get_object_by_snapshot_id(home.engine(), 1).unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
    let err = agent
        .get_snapshot_id_of_object(home.engine(), &handle)
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));

    agent.enable().unwrap();
    home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
    agent.disable().unwrap();

    let id = agent
        .get_snapshot_id_of_object(home.engine(), &handle)
        .unwrap();
    let found = agent
        .get_object_by_snapshot_id(home.engine(), i64::from(id))
        .unwrap();
    assert_eq!(found, handle);
}

#[tokio::test]
async fn unwritable_destination_is_reported_in_stats() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let mut home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(&missing));

    agent.enable().unwrap();
    home.run_for(Duration::from_millis(PERIOD_MS / 2)).await;
    agent.disable().unwrap();

    let stats = agent.stats();
    assert_eq!(stats.snapshot_failures, 1);
    assert_eq!(stats.snapshots_taken, 0);
    assert_eq!(stats.next_snapshot_number, 0);
    assert!(!missing.exists());
}

#[tokio::test]
async fn shutdown_with_a_pending_request_releases_it() {
    let dir = tempfile::tempdir().unwrap();
    let home = home_loop();
    let agent = Agent::new(home.scheduler(), &agent_config(dir.path()));

    agent.enable().unwrap();
    // Wait for the worker to arm a request without letting the loop run it.
    for _ in 0..200 {
        if agent.stats().requests_armed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    agent.disable().unwrap();
    let engine = home.shutdown();

    let mut stats = agent.stats();
    for _ in 0..200 {
        if stats.requests_released == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        stats = agent.stats();
    }
    assert_eq!(stats.requests_armed, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(stats.snapshots_taken, 0);
    assert_eq!(engine.snapshots_taken(), 0);
    assert!(snapshot_files(dir.path()).is_empty());
}

#[tokio::test]
async fn agent_on_a_shut_down_loop_keeps_releasing_requests() {
    let dir = tempfile::tempdir().unwrap();
    let home = home_loop();
    let scheduler = home.scheduler();
    let _engine = home.shutdown();

    let config = AgentConfig {
        period_ms: 50,
        ..agent_config(dir.path())
    };
    let agent = Agent::new(scheduler, &config);
    agent.enable().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    agent.disable().unwrap();

    let mut stats = agent.stats();
    for _ in 0..100 {
        if stats.requests_released == stats.requests_armed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        stats = agent.stats();
    }
    assert!(stats.requests_armed > 1);
    assert_eq!(stats.requests_released, stats.requests_armed);
    assert_eq!(stats.skipped_ticks, 0);
    assert_eq!(stats.snapshots_taken, 0);
    assert!(snapshot_files(dir.path()).is_empty());
}
