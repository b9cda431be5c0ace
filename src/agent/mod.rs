//! The heap snapshot agent.
//!
//! [`Agent`] is the process-scoped context: it owns the background
//! [`worker::AgentWorker`] while enabled and the state the protected action
//! mutates on the home thread. A timer tick on the worker arms one
//! [`request::SnapshotRequest`] at a time and hands it to both trigger paths of
//! the [`bridge::EngineBridge`]; whichever fires first on the home thread runs
//! [`action`].

pub mod action;
pub mod bridge;
pub mod request;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::engine::{ObjectLookup, Scheduler};
use crate::heap::lookup;
use crate::heap::timeline::StatisticsTimeline;

use action::SnapshotMetaData;
use worker::AgentWorker;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    Allocation(String),
    #[error("{0}")]
    Deallocation(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
}

/// State only the protected action reads or writes.
#[derive(Debug)]
pub struct HomeState {
    pub timeline: StatisticsTimeline,
    pub metadata: SnapshotMetaData,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub ticks: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub requests_armed: AtomicU64,
    pub requests_released: AtomicU64,
    pub snapshots_taken: AtomicU64,
    pub snapshot_failures: AtomicU64,
    pub last_mean: AtomicU64,
}

/// Shared between the worker thread and the home thread.
#[derive(Debug)]
pub struct SharedState {
    /// Id of the request currently in flight, 0 when none.
    outstanding: AtomicU64,
    next_request_id: AtomicU64,
    pub counters: Counters,
    pub home: Mutex<HomeState>,
    pub pid: u32,
}

impl SharedState {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            outstanding: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            counters: Counters::default(),
            home: Mutex::new(HomeState {
                timeline: StatisticsTimeline::new(config.timeline_capacity),
                metadata: SnapshotMetaData::new(config.destination_dir.clone()),
            }),
            pid: std::process::id(),
        }
    }

    /// Claims the outstanding slot for a fresh request id. `None` while
    /// another request is still in flight.
    pub fn try_arm(&self) -> Option<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| id)
    }

    /// Frees the outstanding slot if `id` still holds it.
    pub fn clear_outstanding(&self, id: u64) -> bool {
        self.outstanding
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn outstanding(&self) -> Option<u64> {
        match self.outstanding.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub enabled: bool,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub requests_armed: u64,
    pub requests_released: u64,
    pub snapshots_taken: u64,
    pub snapshot_failures: u64,
    pub next_snapshot_number: u64,
    pub last_mean: u64,
    pub timeline_len: usize,
}

pub struct Agent {
    scheduler: Arc<dyn Scheduler>,
    config: AgentConfig,
    shared: Arc<SharedState>,
    worker: Mutex<Option<AgentWorker>>,
}

impl Agent {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: &AgentConfig) -> Self {
        Self {
            scheduler,
            config: config.clone(),
            shared: Arc::new(SharedState::new(config)),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background worker. A no-op when already enabled.
    pub fn enable(&self) -> Result<(), AgentError> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            debug!("agent already enabled");
            return Ok(());
        }
        let worker = AgentWorker::start(
            &self.config,
            Arc::clone(&self.shared),
            Arc::clone(&self.scheduler),
        )?;
        *slot = Some(worker);
        info!(
            period_ms = self.config.period_ms,
            destination = %self.config.destination_dir.display(),
            "heap snapshot agent enabled"
        );
        Ok(())
    }

    /// Stops further timer ticks. A request already in flight still
    /// completes. A no-op when not enabled.
    pub fn disable(&self) -> Result<(), AgentError> {
        let mut slot = self.worker.lock();
        let Some(worker) = slot.as_mut() else {
            debug!("agent already disabled");
            return Ok(());
        };
        worker.stop()?;
        *slot = None;
        info!("heap snapshot agent disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn destination_dir(&self) -> PathBuf {
        self.shared.home.lock().metadata.destination_directory.clone()
    }

    pub fn stats(&self) -> AgentStats {
        let counters = &self.shared.counters;
        let home = self.shared.home.lock();
        AgentStats {
            enabled: self.is_enabled(),
            ticks: counters.ticks.load(Ordering::Relaxed),
            skipped_ticks: counters.skipped_ticks.load(Ordering::Relaxed),
            requests_armed: counters.requests_armed.load(Ordering::Relaxed),
            requests_released: counters.requests_released.load(Ordering::Relaxed),
            snapshots_taken: counters.snapshots_taken.load(Ordering::Relaxed),
            snapshot_failures: counters.snapshot_failures.load(Ordering::Relaxed),
            next_snapshot_number: home.metadata.snapshot_number,
            last_mean: counters.last_mean.load(Ordering::Relaxed),
            timeline_len: home.timeline.len(),
        }
    }

    pub fn get_object_by_snapshot_id<L: ObjectLookup>(
        &self,
        lookup: &L,
        id: i64,
    ) -> Result<L::Handle, AgentError> {
        lookup::lookup_object_by_id(lookup, id)
    }

    pub fn get_snapshot_id_of_object<L: ObjectLookup>(
        &self,
        lookup: &L,
        handle: &L::Handle,
    ) -> Result<u32, AgentError> {
        lookup::id_of_object(lookup, handle)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.get_mut().take()
            && let Err(err) = worker.stop()
        {
            debug!(%err, "agent worker already gone at drop");
        }
    }
}
