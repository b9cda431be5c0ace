//! Interfaces the agent consumes from the embedding engine and its event loop.
//!
//! The capabilities are split by thread affinity: [`Isolate`] is only ever
//! handed out on the engine's home thread, while a
//! [`Scheduler`] is `Send + Sync` and is the only thing the agent's worker
//! thread is allowed to hold.

pub mod sim;

use crate::heap::output::{OutputStream, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStatistics {
    pub used_heap_size: u64,
    pub heap_size_limit: u64,
}

impl HeapStatistics {
    /// Percentage of the heap limit in use, truncated. Zero when the limit is
    /// unknown.
    pub fn percent_used(&self) -> u64 {
        if self.heap_size_limit == 0 {
            return 0;
        }
        ((u128::from(self.used_heap_size) * 100) / u128::from(self.heap_size_limit)) as u64
    }
}

/// Home-thread view of the engine.
pub trait Isolate {
    fn heap_statistics(&self) -> HeapStatistics;

    /// Serialises a full heap snapshot through `sink`. The snapshot is
    /// released before returning.
    fn take_heap_snapshot(&mut self, sink: &mut dyn OutputStream) -> Result<(), SnapshotError>;

    /// Forbids user code and microtask draining until the matching
    /// [`Isolate::allow_execution`]. Calls nest.
    fn disallow_execution(&mut self);

    fn allow_execution(&mut self);
}

/// Profiler bookkeeping that maps snapshot ids to live objects.
pub trait ObjectLookup {
    type Handle;

    fn find_object_by_id(&self, id: u32) -> Option<Self::Handle>;

    /// Returns 0 when the object has no snapshot id.
    fn object_id(&self, handle: &Self::Handle) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Completed,
    Canceled,
}

/// Runs on the home thread at the next safe point.
pub type HomeCallback = Box<dyn FnOnce(&mut dyn Isolate) + Send>;

/// Body of a background task; runs on an arbitrary pool thread.
pub type WorkFn = Box<dyn FnOnce() + Send>;

/// Completion of a background task; runs on the home thread.
pub type AfterWorkFn = Box<dyn FnOnce(&mut dyn Isolate, WorkStatus) + Send>;

/// Thread-safe entry points into the home thread.
pub trait Scheduler: Send + Sync {
    /// Registers a one-shot callback to run when no user code is executing.
    fn request_interrupt(&self, callback: HomeCallback);

    /// Queues `work` on the background pool; `after` is delivered on the home
    /// loop, with [`WorkStatus::Canceled`] if the loop shuts down first.
    fn queue_work(&self, work: WorkFn, after: AfterWorkFn);
}

/// Keeps user code suspended for as long as it is alive.
pub struct ExecutionScope<'a> {
    isolate: &'a mut dyn Isolate,
}

impl<'a> ExecutionScope<'a> {
    pub fn enter(isolate: &'a mut dyn Isolate) -> Self {
        isolate.disallow_execution();
        Self { isolate }
    }

    pub fn isolate(&mut self) -> &mut dyn Isolate {
        &mut *self.isolate
    }
}

impl Drop for ExecutionScope<'_> {
    fn drop(&mut self) {
        self.isolate.allow_execution();
    }
}
