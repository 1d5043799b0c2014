//! Snapshot persistence
//!
//! `writer` owns buffering, flush scheduling and file rotation; the actual
//! encoding sits behind [`SinkFactory`]/[`RowSink`] so rotation logic can be
//! exercised without touching Parquet.

pub mod parquet_sink;
pub mod writer;

use std::io;
use std::path::Path;

use crate::book::SnapshotRow;

pub use parquet_sink::ParquetSinkFactory;
pub use writer::{FlushOutcome, RotatingWriter, WriterConfig, WriterStats, WriterStatsSnapshot};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum StorageError {
    /// Out of space (or quota). Terminal for the writer.
    DiskFull(io::Error),
    Io(io::Error),
    /// Encoder rejected the data or failed internally.
    Encode(String),
}

impl StorageError {
    /// Classify an I/O error, promoting out-of-space conditions.
    pub fn from_io(err: io::Error) -> Self {
        if is_disk_full(&err) {
            Self::DiskFull(err)
        } else {
            Self::Io(err)
        }
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull(_))
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DiskFull(e) => write!(f, "disk full: {}", e),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DiskFull(e) | Self::Io(e) => Some(e),
            Self::Encode(_) => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

/// True for ENOSPC / EDQUOT (unix) and the disk-full codes on Windows.
pub fn is_disk_full(err: &io::Error) -> bool {
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == libc::ENOSPC || code == libc::EDQUOT,
        // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        #[cfg(windows)]
        Some(code) => code == 39 || code == 112,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}

// =============================================================================
// SINK SEAM
// =============================================================================

/// An open output file accepting rows in arrival order.
pub trait RowSink: Send {
    fn append(&mut self, rows: &[SnapshotRow]) -> Result<(), StorageError>;

    /// Finish the file (footer, fsync). Consumes the sink.
    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Creates sinks for new output files.
pub trait SinkFactory: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &str;

    /// Create `path`. Must fail rather than truncate an existing file.
    fn create(&self, path: &Path) -> Result<Box<dyn RowSink>, StorageError>;
}
