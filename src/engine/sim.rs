//! In-process stand-in for an embedding engine.
//!
//! [`SimEngine`] is a heap of named objects that grows as simulated user code
//! runs. [`HomeLoop`] drives it on the calling (home) thread and implements
//! the [`Scheduler`] entry points other threads use to reach it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{
    AfterWorkFn, HeapStatistics, HomeCallback, Isolate, ObjectLookup, Scheduler, WorkFn,
    WorkStatus,
};
use crate::heap::output::{OutputStream, SnapshotError, WriteResult};

const ROOT_SIZE: u64 = 1024;

#[derive(Debug, Clone)]
struct SimObject {
    name: String,
    size: u64,
    /// Assigned the first time a snapshot sees the object.
    snapshot_id: u32,
}

/// Opaque reference to a live simulated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimHandle(u64);

#[derive(Debug)]
pub struct SimEngine {
    objects: BTreeMap<u64, SimObject>,
    next_serial: u64,
    next_snapshot_id: u32,
    heap_size_limit: u64,
    allocation_bytes: u64,
    disallow_depth: u32,
    user_steps: u64,
    snapshots_taken: u64,
}

impl SimEngine {
    pub fn new(heap_size_limit: u64, allocation_bytes: u64) -> Self {
        let mut engine = Self {
            objects: BTreeMap::new(),
            next_serial: 0,
            next_snapshot_id: 1,
            heap_size_limit,
            allocation_bytes,
            disallow_depth: 0,
            user_steps: 0,
            snapshots_taken: 0,
        };
        engine.allocate("global".to_string(), ROOT_SIZE);
        engine
    }

    /// Runs one slice of user code: allocates an object and collects the
    /// oldest half of the heap once it passes half the limit. Returns false
    /// without running while execution is disallowed.
    pub fn run_user_step(&mut self) -> bool {
        if !self.execution_allowed() {
            trace!("user code blocked by execution scope");
            return false;
        }
        self.user_steps += 1;
        let name = format!("alloc_{}", self.next_serial);
        self.allocate(name, self.allocation_bytes);
        if self.used_heap_size() > self.heap_size_limit / 2 {
            self.collect_garbage();
        }
        true
    }

    /// Allocates an object outside of user code, returning its handle.
    pub fn allocate(&mut self, name: String, size: u64) -> SimHandle {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.objects.insert(
            serial,
            SimObject {
                name,
                size,
                snapshot_id: 0,
            },
        );
        SimHandle(serial)
    }

    pub fn execution_allowed(&self) -> bool {
        self.disallow_depth == 0
    }

    pub fn user_steps(&self) -> u64 {
        self.user_steps
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken
    }

    #[cfg(test)]
    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn used_heap_size(&self) -> u64 {
        self.objects.values().map(|o| o.size).sum()
    }

    fn collect_garbage(&mut self) {
        let collectable: Vec<u64> = self.objects.keys().copied().filter(|&s| s != 0).collect();
        let victims = collectable.len() / 2;
        for serial in collectable.into_iter().take(victims) {
            self.objects.remove(&serial);
        }
        debug!(
            collected = victims,
            live = self.objects.len(),
            "simulated garbage collection"
        );
    }
}

#[derive(Serialize)]
struct SnapshotDocument<'a> {
    snapshot: SnapshotHeader,
    nodes: Vec<NodeRecord<'a>>,
}

#[derive(Serialize)]
struct SnapshotHeader {
    node_count: usize,
    total_size: u64,
    heap_size_limit: u64,
}

#[derive(Serialize)]
struct NodeRecord<'a> {
    id: u32,
    name: &'a str,
    self_size: u64,
}

impl Isolate for SimEngine {
    fn heap_statistics(&self) -> HeapStatistics {
        HeapStatistics {
            used_heap_size: self.used_heap_size(),
            heap_size_limit: self.heap_size_limit,
        }
    }

    fn take_heap_snapshot(&mut self, sink: &mut dyn OutputStream) -> Result<(), SnapshotError> {
        for object in self.objects.values_mut() {
            if object.snapshot_id == 0 {
                object.snapshot_id = self.next_snapshot_id;
                self.next_snapshot_id += 1;
            }
        }
        let document = SnapshotDocument {
            snapshot: SnapshotHeader {
                node_count: self.objects.len(),
                total_size: self.used_heap_size(),
                heap_size_limit: self.heap_size_limit,
            },
            nodes: self
                .objects
                .values()
                .map(|o| NodeRecord {
                    id: o.snapshot_id,
                    name: &o.name,
                    self_size: o.size,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&document)
            .map_err(|err| SnapshotError::Write(std::io::Error::other(err)))?;

        let chunk_size = sink.chunk_size().max(1);
        for chunk in bytes.chunks(chunk_size) {
            if sink.write_chunk(chunk) == WriteResult::Abort {
                return Err(SnapshotError::Aborted);
            }
        }
        sink.end_of_stream();
        self.snapshots_taken += 1;
        Ok(())
    }

    fn disallow_execution(&mut self) {
        self.disallow_depth += 1;
    }

    fn allow_execution(&mut self) {
        self.disallow_depth = self.disallow_depth.saturating_sub(1);
    }
}

impl ObjectLookup for SimEngine {
    type Handle = SimHandle;

    fn find_object_by_id(&self, id: u32) -> Option<SimHandle> {
        if id == 0 {
            return None;
        }
        self.objects
            .iter()
            .find(|(_, o)| o.snapshot_id == id)
            .map(|(&serial, _)| SimHandle(serial))
    }

    fn object_id(&self, handle: &SimHandle) -> u32 {
        self.objects
            .get(&handle.0)
            .map(|o| o.snapshot_id)
            .unwrap_or(0)
    }
}

enum HomeEvent {
    Wake,
    WorkDone(AfterWorkFn, WorkStatus),
}

/// Thread-safe handle into a [`HomeLoop`].
pub struct SimScheduler {
    events: mpsc::UnboundedSender<HomeEvent>,
    interrupts: Mutex<VecDeque<HomeCallback>>,
    closing: AtomicBool,
    runtime: Handle,
}

impl Scheduler for SimScheduler {
    fn request_interrupt(&self, callback: HomeCallback) {
        let mut interrupts = self.interrupts.lock();
        // Checked under the queue lock so shutdown cannot drain in between.
        if self.closing.load(Ordering::Acquire) {
            drop(interrupts);
            trace!("home loop closing, interrupt dropped");
            return;
        }
        interrupts.push_back(callback);
        drop(interrupts);
        let _ = self.events.send(HomeEvent::Wake);
    }

    fn queue_work(&self, work: WorkFn, after: AfterWorkFn) {
        if self.closing.load(Ordering::Acquire) {
            trace!("home loop closing, background work dropped");
            return;
        }
        let events = self.events.clone();
        self.runtime.spawn_blocking(move || {
            work();
            // A closed loop drops the completion, which releases whatever it
            // captured.
            let _ = events.send(HomeEvent::WorkDone(after, WorkStatus::Completed));
        });
    }
}

/// Event loop of the simulated engine's home thread.
pub struct HomeLoop {
    engine: SimEngine,
    events: mpsc::UnboundedReceiver<HomeEvent>,
    scheduler: Arc<SimScheduler>,
    step: Duration,
}

enum Turn {
    Deadline,
    Step,
    Event(Option<HomeEvent>),
}

impl HomeLoop {
    /// Must be called from within a tokio runtime; background work runs on
    /// that runtime's blocking pool.
    pub fn new(engine: SimEngine, step: Duration) -> Result<Self, TryCurrentError> {
        let runtime = Handle::try_current()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            engine,
            events: rx,
            scheduler: Arc::new(SimScheduler {
                events: tx,
                interrupts: Mutex::new(VecDeque::new()),
                closing: AtomicBool::new(false),
                runtime,
            }),
            step: step.max(Duration::from_millis(1)),
        })
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SimEngine {
        &mut self.engine
    }

    /// Runs user code and delivers callbacks until `duration` has elapsed.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut step = tokio::time::interval(self.step);
        step.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let turn = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Turn::Deadline,
                event = self.events.recv() => Turn::Event(event),
                _ = step.tick() => Turn::Step,
            };
            match turn {
                Turn::Deadline | Turn::Event(None) => break,
                Turn::Step => {
                    self.safe_point();
                    self.engine.run_user_step();
                }
                Turn::Event(Some(event)) => self.dispatch(event),
            }
        }
        self.safe_point();
    }

    /// Runs every pending interrupt callback. Returns how many ran.
    pub fn safe_point(&mut self) -> usize {
        let mut ran = 0;
        loop {
            let Some(callback) = self.scheduler.interrupts.lock().pop_front() else {
                break;
            };
            callback(&mut self.engine);
            ran += 1;
        }
        ran
    }

    fn dispatch(&mut self, event: HomeEvent) {
        match event {
            HomeEvent::Wake => {
                self.safe_point();
            }
            HomeEvent::WorkDone(after, status) => after(&mut self.engine, status),
        }
    }

    /// Tears the loop down. Completions still queued are delivered as
    /// [`WorkStatus::Canceled`]; interrupts that never reached a safe point
    /// are dropped.
    pub fn shutdown(mut self) -> SimEngine {
        {
            let _interrupts = self.scheduler.interrupts.lock();
            self.scheduler.closing.store(true, Ordering::Release);
        }
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let HomeEvent::WorkDone(after, _) = event {
                after(&mut self.engine, WorkStatus::Canceled);
            }
        }
        let undelivered: Vec<HomeCallback> = self.scheduler.interrupts.lock().drain(..).collect();
        debug!(
            dropped_interrupts = undelivered.len(),
            "home loop shut down"
        );
        drop(undelivered);
        self.engine
    }
}
