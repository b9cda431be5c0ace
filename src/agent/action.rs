use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use super::{HomeState, SharedState};
use crate::engine::{ExecutionScope, Isolate};
use crate::format::usage_summary;
use crate::heap::output::{ChunkWriter, FileOutputStream, SnapshotError};

#[derive(Debug, Clone)]
pub struct SnapshotMetaData {
    /// Sequence number of the next snapshot file.
    pub snapshot_number: u64,
    pub destination_directory: PathBuf,
}

impl SnapshotMetaData {
    pub fn new(destination_directory: PathBuf) -> Self {
        Self {
            snapshot_number: 0,
            destination_directory,
        }
    }

    pub fn path_for(&self, pid: u32, sequence: u64) -> PathBuf {
        self.destination_directory
            .join(format!("{pid}.{sequence}.heapsnapshot"))
    }
}

/// Builds the action armed for request `request_id`.
pub fn protected(
    shared: Arc<SharedState>,
    request_id: u64,
) -> impl Fn(&mut dyn Isolate) + Send + Sync + 'static {
    move |isolate: &mut dyn Isolate| run(isolate, &shared, request_id)
}

/// Samples heap usage and writes one snapshot. Must run on the home thread.
pub fn run(isolate: &mut dyn Isolate, shared: &SharedState, request_id: u64) {
    {
        let mut scope = ExecutionScope::enter(isolate);
        let mut home = shared.home.lock();
        sample(scope.isolate(), &mut home, shared);

        match write_snapshot(scope.isolate(), &mut home.metadata, shared.pid) {
            Ok(path) => {
                shared.counters.snapshots_taken.fetch_add(1, Ordering::Relaxed);
                info!(path = %path.display(), "heap snapshot written");
            }
            Err(err) => {
                shared
                    .counters
                    .snapshot_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%err, "heap snapshot failed");
            }
        }
    }
    shared.clear_outstanding(request_id);
}

fn sample(isolate: &mut dyn Isolate, home: &mut HomeState, shared: &SharedState) {
    let stats = isolate.heap_statistics();
    home.timeline.record(stats.used_heap_size);
    let mean = home.timeline.mean();
    shared.counters.last_mean.store(mean, Ordering::Relaxed);
    info!(
        used = stats.used_heap_size,
        limit = stats.heap_size_limit,
        mean,
        percent = stats.percent_used(),
        "{}",
        usage_summary(&stats, mean)
    );
}

fn write_snapshot(
    isolate: &mut dyn Isolate,
    metadata: &mut SnapshotMetaData,
    pid: u32,
) -> Result<PathBuf, SnapshotError> {
    let sequence = metadata.snapshot_number;
    let path = metadata.path_for(pid, sequence);
    info!(sequence, "taking snapshot");

    let mut stream = FileOutputStream::create(&path)?;
    let written = stream_snapshot(isolate, &mut stream).and_then(|()| stream.close());
    if let Err(err) = written {
        discard_partial(&path);
        return Err(err);
    }

    metadata.snapshot_number += 1;
    Ok(path)
}

/// An abort caused by the writer reports the underlying I/O error.
fn stream_snapshot<W: Write>(
    isolate: &mut dyn Isolate,
    stream: &mut ChunkWriter<W>,
) -> Result<(), SnapshotError> {
    match isolate.take_heap_snapshot(stream) {
        Err(SnapshotError::Aborted) => Err(stream
            .take_error()
            .map_or(SnapshotError::Aborted, SnapshotError::Write)),
        other => other,
    }
}

fn discard_partial(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), %err, "could not remove partial snapshot");
    }
}
