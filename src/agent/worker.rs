//! Background thread that decides when to attempt a snapshot.
//!
//! The worker owns a private current-thread runtime and a repeating timer.
//! It never touches engine state: each tick only arms a request and hands it
//! to the [`EngineBridge`], whose entry points are thread safe.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::bridge::EngineBridge;
use super::request::SnapshotRequest;
use super::{AgentError, SharedState, action};
use crate::config::AgentConfig;
use crate::engine::Scheduler;

const THREAD_NAME: &str = "heapwatch-agent";

pub struct AgentWorker {
    stop: Option<oneshot::Sender<()>>,
    thread: JoinHandle<()>,
}

impl AgentWorker {
    /// Builds the private loop and timer and starts the worker thread. Nothing
    /// is left running if any stage fails.
    pub fn start(
        config: &AgentConfig,
        shared: Arc<SharedState>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, AgentError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| allocation_error("runtime", err))?;

        let period = config.period();
        let initial_delay = config.initial_delay();
        let ticker = Ticker {
            shared,
            bridge: EngineBridge::new(scheduler),
        };
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let start = tokio::time::Instant::now() + initial_delay;
                    let mut timer = tokio::time::interval_at(start, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            biased;
                            _ = &mut stop_rx => break,
                            _ = timer.tick() => ticker.on_tick(),
                        }
                    }
                });
                debug!("agent worker loop exited");
            })
            .map_err(|err| allocation_error("thread", err))?;

        debug!(?period, ?initial_delay, "agent worker started");
        Ok(Self {
            stop: Some(stop_tx),
            thread,
        })
    }

    /// Halts further timer fires. The thread is not joined; its loop exits on
    /// its own once the timer is stopped.
    pub fn stop(&mut self) -> Result<(), AgentError> {
        let Some(stop) = self.stop.take() else {
            return Ok(());
        };
        if stop.send(()).is_err() {
            return Err(AgentError::Deallocation(
                "cannot deallocate agent polling timer".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

fn allocation_error(stage: &str, err: std::io::Error) -> AgentError {
    warn!(stage, %err, "agent worker setup failed");
    AgentError::Allocation("cannot allocate agent polling timer".to_string())
}

struct Ticker {
    shared: Arc<SharedState>,
    bridge: EngineBridge,
}

impl Ticker {
    fn on_tick(&self) {
        let counters = &self.shared.counters;
        counters.ticks.fetch_add(1, Ordering::Relaxed);

        let Some(request_id) = self.shared.try_arm() else {
            counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            info!("still waiting");
            return;
        };
        counters.requests_armed.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let request = SnapshotRequest::new(request_id).on_release(move |claimed| {
            shared
                .counters
                .requests_released
                .fetch_add(1, Ordering::Relaxed);
            // A claimed request clears the slot from the protected action.
            if !claimed && shared.clear_outstanding(request_id) {
                debug!(request = request_id, "request released without running");
            }
        });
        debug!(request = request_id, "snapshot request armed");
        self.bridge
            .submit(request, action::protected(Arc::clone(&self.shared), request_id));
    }
}
