use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot open snapshot destination {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot write failed: {0}")]
    Write(#[from] io::Error),
    #[error("snapshot serialization aborted by the output stream")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Continue,
    Abort,
}

/// Streaming sink the engine serialises a heap snapshot into.
pub trait OutputStream {
    /// Preferred chunk size in bytes.
    fn chunk_size(&self) -> usize {
        64 * 1024
    }

    fn write_chunk(&mut self, data: &[u8]) -> WriteResult;

    fn end_of_stream(&mut self);
}

/// Sequential writer that retries partial writes until a chunk is fully
/// written or the underlying writer fails.
#[derive(Debug)]
pub struct ChunkWriter<W: Write> {
    inner: W,
    ended: bool,
    written: u64,
    error: Option<io::Error>,
}

pub type FileOutputStream = ChunkWriter<File>;

impl FileOutputStream {
    /// Opens `path` write-only, creating or truncating it.
    pub fn create(path: &Path) -> Result<Self, SnapshotError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| SnapshotError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(ChunkWriter::new(file))
    }

    /// Flushes and syncs the file to disk, surfacing any error seen while
    /// writing or closing.
    pub fn close(mut self) -> Result<u64, SnapshotError> {
        self.end_of_stream();
        if self.error.is_none()
            && let Err(err) = self.inner.sync_all()
        {
            self.error = Some(err);
        }
        self.finish()
    }
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            ended: false,
            written: 0,
            error: None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// The I/O error that made the writer abort, if any.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    /// Consumes the writer, surfacing the first I/O error seen while writing
    /// or closing.
    pub fn finish(mut self) -> Result<u64, SnapshotError> {
        self.end_of_stream();
        match self.error.take() {
            Some(err) => Err(SnapshotError::Write(err)),
            None => Ok(self.written),
        }
    }

    fn write_fully(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.ended {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after end of stream",
            ));
        }
        while !data.is_empty() {
            match self.inner.write(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "writer accepted zero bytes",
                    ));
                }
                Ok(n) => {
                    self.written += n as u64;
                    data = &data[n..];
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl<W: Write> OutputStream for ChunkWriter<W> {
    fn write_chunk(&mut self, data: &[u8]) -> WriteResult {
        if self.error.is_some() {
            return WriteResult::Abort;
        }
        match self.write_fully(data) {
            Ok(()) => WriteResult::Continue,
            Err(err) => {
                self.error = Some(err);
                WriteResult::Abort
            }
        }
    }

    fn end_of_stream(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Err(err) = self.inner.flush()
            && self.error.is_none()
        {
            self.error = Some(err);
        }
    }
}
