//! Rotating batched writer
//!
//! Rows are buffered in memory and drained to the active file by a single
//! flush consumer. Three producers request flushes: the batch-size
//! threshold in [`RotatingWriter::enqueue`], the interval timer, and
//! [`RotatingWriter::shutdown`]. The rotation mutex doubles as the in-flight
//! guard: producers `try_lock` and back off if a flush is already running.
//!
//! Files rotate when a row's UTC hour differs from the active file's hour, or
//! when the active file reaches `max_rows_per_file`.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{SinkFactory, RowSink, StorageError};
use crate::book::SnapshotRow;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory receiving the output files.
    pub out_dir: PathBuf,
    /// Pair label used in file names.
    pub pair: String,
    /// Pending rows that trigger an early flush.
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Hard cap on rows per file; the next row opens a new file.
    pub max_rows_per_file: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("data"),
            pair: "BTCUSD".to_string(),
            batch_size: 500,
            flush_interval: Duration::from_secs(5),
            max_rows_per_file: 500_000,
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
pub struct WriterStats {
    pub rows_enqueued: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub flushes: AtomicU64,
    pub files_opened: AtomicU64,
    pub write_errors: AtomicU64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            rows_enqueued: self.rows_enqueued.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WriterStatsSnapshot {
    pub rows_enqueued: u64,
    pub rows_written: u64,
    pub rows_dropped: u64,
    pub flushes: u64,
    pub files_opened: u64,
    pub write_errors: u64,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered.
    Empty,
    /// Another flush holds the rotation state.
    InFlight,
    /// Disk-full state; nothing will be written again.
    Halted,
    Written(usize),
    /// Batch discarded after a write error.
    Dropped(usize),
}

// =============================================================================
// ROTATION STATE
// =============================================================================

struct ActiveFile {
    path: PathBuf,
    hour_key: String,
    rows: u64,
    sink: Box<dyn RowSink>,
}

struct WriteFailure {
    error: StorageError,
    path: Option<PathBuf>,
    written: usize,
}

/// File-side state, only touched while holding the rotation lock.
struct RotationState {
    out_dir: PathBuf,
    pair: String,
    max_rows_per_file: u64,
    factory: Arc<dyn SinkFactory>,
    stats: Arc<WriterStats>,
    active: Option<ActiveFile>,
}

impl RotationState {
    /// Append `rows` in order, rotating wherever a row crosses an hour or the
    /// row cap. Each contiguous run sharing a file is one sink append.
    fn write_rows(&mut self, rows: &[SnapshotRow]) -> Result<usize, WriteFailure> {
        let keys: Vec<String> = rows.iter().map(SnapshotRow::hour_key).collect();
        let mut written = 0usize;
        let mut start = 0usize;

        while start < rows.len() {
            let key = &keys[start];
            let mut active = match self.active.take() {
                Some(file) if file.hour_key == *key && file.rows < self.max_rows_per_file => file,
                previous => {
                    if let Some(file) = previous {
                        self.close_file(file).map_err(|error| WriteFailure {
                            error,
                            path: None,
                            written,
                        })?;
                    }
                    self.open_file(key).map_err(|error| WriteFailure {
                        error,
                        path: None,
                        written,
                    })?
                }
            };

            let room = (self.max_rows_per_file - active.rows).max(1) as usize;
            let mut end = start + 1;
            while end < rows.len() && end - start < room && keys[end] == *key {
                end += 1;
            }

            let result = active.sink.append(&rows[start..end]);
            match result {
                Ok(()) => {
                    active.rows += (end - start) as u64;
                    written += end - start;
                    self.active = Some(active);
                }
                Err(error) => {
                    let path = Some(active.path.clone());
                    if error.is_disk_full() {
                        self.active = Some(active);
                        return Err(WriteFailure {
                            error,
                            path,
                            written,
                        });
                    }
                    // A failed encoder is not trusted with more rows. Running
                    // out of space while abandoning it still halts the writer.
                    let error = match self.close_file(active) {
                        Err(close_err) => close_err,
                        Ok(()) => error,
                    };
                    return Err(WriteFailure {
                        error,
                        path,
                        written,
                    });
                }
            }
            start = end;
        }

        Ok(written)
    }

    fn open_file(&mut self, hour_key: &str) -> Result<ActiveFile, StorageError> {
        let path = next_free_path(&self.out_dir, hour_key, &self.pair, self.factory.extension());
        let sink = self.factory.create(&path)?;
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        info!(path = %path.display(), hour = hour_key, "📂 Opened output file");

        Ok(ActiveFile {
            path,
            hour_key: hour_key.to_string(),
            rows: 0,
            sink,
        })
    }

    /// Close a file. Only disk exhaustion is propagated; other close errors
    /// are logged and the caller moves on.
    fn close_file(&self, file: ActiveFile) -> Result<(), StorageError> {
        let ActiveFile {
            path, rows, sink, ..
        } = file;
        match sink.close() {
            Ok(()) => {
                info!(path = %path.display(), rows, "📁 Closed output file");
                Ok(())
            }
            Err(e) if e.is_disk_full() => Err(e),
            Err(e) => {
                error!(path = %path.display(), rows, error = %e, "Failed to close output file");
                Ok(())
            }
        }
    }

    fn close_active(&mut self) {
        if let Some(file) = self.active.take() {
            let path = file.path.clone();
            if let Err(e) = self.close_file(file) {
                error!(path = %path.display(), error = %e, "Failed to close output file");
            }
        }
    }

    fn active_summary(&self) -> Option<(PathBuf, u64)> {
        self.active.as_ref().map(|f| (f.path.clone(), f.rows))
    }
}

/// `<hour_key>_<PAIR>.<ext>`, or `..._partN.<ext>` if that name is taken.
pub fn file_name(hour_key: &str, pair: &str, ext: &str, part: u32) -> String {
    if part == 0 {
        format!("{}_{}.{}", hour_key, pair, ext)
    } else {
        format!("{}_{}_part{}.{}", hour_key, pair, part, ext)
    }
}

fn next_free_path(dir: &Path, hour_key: &str, pair: &str, ext: &str) -> PathBuf {
    let mut part = 0u32;
    loop {
        let candidate = dir.join(file_name(hour_key, pair, ext, part));
        if !candidate.exists() {
            return candidate;
        }
        part += 1;
    }
}

// =============================================================================
// WRITER
// =============================================================================

pub struct RotatingWriter {
    config: WriterConfig,
    pending: Mutex<Vec<SnapshotRow>>,
    rotation: Arc<AsyncMutex<RotationState>>,
    flush_scheduled: AtomicBool,
    disk_full: AtomicBool,
    disk_full_tx: watch::Sender<bool>,
    stats: Arc<WriterStats>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RotatingWriter {
    /// Create the writer and its output directory. Does not start the timer.
    pub fn new(config: WriterConfig, factory: Arc<dyn SinkFactory>) -> Result<Arc<Self>, StorageError> {
        std::fs::create_dir_all(&config.out_dir)?;

        let stats = Arc::new(WriterStats::default());
        let rotation = RotationState {
            out_dir: config.out_dir.clone(),
            pair: config.pair.clone(),
            max_rows_per_file: config.max_rows_per_file.max(1),
            factory,
            stats: stats.clone(),
            active: None,
        };
        let (disk_full_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            pending: Mutex::new(Vec::with_capacity(config.batch_size)),
            config,
            rotation: Arc::new(AsyncMutex::new(rotation)),
            flush_scheduled: AtomicBool::new(false),
            disk_full: AtomicBool::new(false),
            disk_full_tx,
            stats,
            timer: Mutex::new(None),
        }))
    }

    /// Spawn the periodic flush task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let writer = self.clone();
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if writer.is_disk_full() {
                    break;
                }
                writer.flush().await;
            }
        }));
    }

    /// Buffer a row. Never waits on I/O.
    pub fn enqueue(self: &Arc<Self>, row: SnapshotRow) {
        if self.is_disk_full() {
            self.stats.rows_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let pending = {
            let mut buffer = self.pending.lock();
            buffer.push(row);
            buffer.len()
        };
        self.stats.rows_enqueued.fetch_add(1, Ordering::Relaxed);

        if pending >= self.config.batch_size && !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            let writer = self.clone();
            tokio::spawn(async move {
                writer.flush_scheduled.store(false, Ordering::Release);
                writer.flush().await;
            });
        }
    }

    /// Drain the buffer to disk unless a flush is already running.
    pub async fn flush(self: &Arc<Self>) -> FlushOutcome {
        if self.is_disk_full() {
            return FlushOutcome::Halted;
        }
        match self.rotation.clone().try_lock_owned() {
            Ok(guard) => self.flush_locked(guard, false).await,
            Err(_) => {
                debug!("flush already in flight");
                FlushOutcome::InFlight
            }
        }
    }

    /// Stop the timer, wait for any running flush, write what is left and
    /// close the active file. Gives up after `timeout`.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) -> Option<FlushOutcome> {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }

        let work = async {
            let guard = self.rotation.clone().lock_owned().await;
            self.flush_locked(guard, true).await
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    pending = self.pending_len(),
                    "Final flush timed out"
                );
                None
            }
        }
    }

    async fn flush_locked(
        self: &Arc<Self>,
        mut guard: OwnedMutexGuard<RotationState>,
        close_after: bool,
    ) -> FlushOutcome {
        if self.is_disk_full() {
            return FlushOutcome::Halted;
        }

        let rows = std::mem::take(&mut *self.pending.lock());
        if rows.is_empty() {
            if close_after {
                if let Err(join_err) = tokio::task::spawn_blocking(move || guard.close_active()).await {
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %join_err, "Close task failed");
                }
            }
            return FlushOutcome::Empty;
        }

        let count = rows.len();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        let joined = tokio::task::spawn_blocking(move || {
            let result = guard.write_rows(&rows);
            let disk_full = matches!(&result, Err(f) if f.error.is_disk_full());
            if disk_full || close_after {
                guard.close_active();
            }
            result
        })
        .await;

        match joined {
            Ok(Ok(written)) => {
                self.stats.rows_written.fetch_add(written as u64, Ordering::Relaxed);
                debug!(rows = written, "flushed snapshot rows");
                FlushOutcome::Written(written)
            }
            Ok(Err(failure)) => self.handle_failure(failure, count),
            Err(join_err) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                self.stats.rows_dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(error = %join_err, rows = count, "Flush task failed; batch dropped");
                FlushOutcome::Dropped(count)
            }
        }
    }

    fn handle_failure(&self, failure: WriteFailure, count: usize) -> FlushOutcome {
        let WriteFailure {
            error,
            path,
            written,
        } = failure;
        let lost = count - written;
        self.stats.rows_written.fetch_add(written as u64, Ordering::Relaxed);
        self.stats.write_errors.fetch_add(1, Ordering::Relaxed);

        let path = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());

        if error.is_disk_full() {
            self.disk_full.store(true, Ordering::Release);
            let discarded = {
                let mut pending = self.pending.lock();
                let n = pending.len();
                pending.clear();
                n
            };
            self.stats
                .rows_dropped
                .fetch_add((lost + discarded) as u64, Ordering::Relaxed);
            error!(
                path = %path,
                error = %error,
                rows_lost = lost + discarded,
                "💥 Disk full; recording halted"
            );
            self.disk_full_tx.send_replace(true);
            return FlushOutcome::Halted;
        }

        self.stats.rows_dropped.fetch_add(lost as u64, Ordering::Relaxed);
        error!(path = %path, error = %error, rows_lost = lost, "Write failed; batch dropped");
        FlushOutcome::Dropped(lost)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn is_disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Acquire)
    }

    /// Fires `true` once the writer enters the disk-full state.
    pub fn subscribe_disk_full(&self) -> watch::Receiver<bool> {
        self.disk_full_tx.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Path and row count of the open file, waiting for any running flush.
    pub async fn active_file(&self) -> Option<(PathBuf, u64)> {
        self.rotation.lock().await.active_summary()
    }
}
