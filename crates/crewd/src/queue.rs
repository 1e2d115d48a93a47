//! Append-only NDJSON file queue.
//!
//! Hook scripts that cannot reach the HTTP endpoint append one JSON record
//! per line to a well-known file. The reader follows that file from a byte
//! offset and forwards each complete line to the registry.
//!
//! Growth is noticed three ways, any one of which is enough:
//!
//! - filesystem notifications (`notify`), debounced to coalesce bursts
//! - a fixed-interval poll
//! - a health check that forces a read when the file grew but no
//!   notification arrived for a while (watchers can stop delivering
//!   without reporting an error)
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - I/O errors are logged and retried on the next wake-up
//! - A deleted queue file is recreated and read from the start
//! - Malformed lines are counted and skipped

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::QueueConfig;
use crate::registry::{RegistryError, RegistryHandle};
use crate::stats::Transport;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

// ============================================================================
// Counters
// ============================================================================

/// Cumulative reader counters, shared with the stats endpoint.
#[derive(Debug, Default)]
pub struct QueueCounters {
    lines_processed: AtomicU64,
    lines_errored: AtomicU64,
    truncations: AtomicU64,
    external_truncations: AtomicU64,
    forced_reads: AtomicU64,
    recreations: AtomicU64,
    offset: AtomicU64,
    partial_held: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub lines_processed: u64,
    pub lines_errored: u64,
    /// Self-truncations after the size threshold.
    pub truncations: u64,
    /// Times the file shrank underneath the reader.
    pub external_truncations: u64,
    /// Reads forced by the health check.
    pub forced_reads: u64,
    /// Times the file was found deleted or replaced.
    pub recreations: u64,
    pub offset: u64,
    pub partial_held: bool,
}

impl QueueCounters {
    pub fn snapshot(&self) -> QueueStats {
        QueueStats {
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            lines_errored: self.lines_errored.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
            external_truncations: self.external_truncations.load(Ordering::Relaxed),
            forced_reads: self.forced_reads.load(Ordering::Relaxed),
            recreations: self.recreations.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            partial_held: self.partial_held.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Follows one queue file. All I/O here is synchronous and bounded by the
/// truncation threshold.
#[derive(Debug)]
pub struct QueueReader {
    path: PathBuf,
    offset: u64,
    /// Device and inode of the file the offset refers to.
    file_id: Option<(u64, u64)>,
    /// Bytes after the last newline, waiting for the rest of their line.
    partial: Vec<u8>,
    truncate_bytes: u64,
    counters: Arc<QueueCounters>,
}

impl QueueReader {
    /// Opens the queue, creating it (and its directory) when missing.
    ///
    /// With `start_offset` the reader resumes there, clamped to the file
    /// size; without it, existing content is skipped.
    pub fn open(
        path: impl Into<PathBuf>,
        start_offset: Option<u64>,
        truncate_bytes: u64,
    ) -> Result<Self, QueueError> {
        let path = path.into();
        create_queue_file(&path)?;

        let state = stat(&path).map_err(|source| io_error(&path, source))?;
        let offset = start_offset.map_or(state.len, |o| o.min(state.len));

        let counters = Arc::new(QueueCounters::default());
        counters.offset.store(offset, Ordering::Relaxed);
        debug!(path = %path.display(), offset, "Queue opened");

        Ok(Self {
            path,
            offset,
            file_id: state.id,
            partial: Vec::new(),
            truncate_bytes,
            counters,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }

    /// Whether the file holds bytes past the offset.
    pub fn has_unread(&self) -> Result<bool, QueueError> {
        Ok(file_len(&self.path)? > self.offset)
    }

    /// Reads everything new and returns the complete, well-formed records.
    ///
    /// Self-truncates afterwards when the file is over the threshold.
    pub fn read_available(&mut self) -> Result<Vec<Value>, QueueError> {
        let mut records = self.read_new()?;
        if self.offset > self.truncate_bytes {
            records.extend(self.truncate()?);
        }
        Ok(records)
    }

    fn read_new(&mut self) -> Result<Vec<Value>, QueueError> {
        let state = match stat(&self.path) {
            Ok(state) => state,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.recreate()?;
                return Ok(Vec::new());
            }
            Err(source) => return Err(io_error(&self.path, source)),
        };
        if state.id != self.file_id {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                "Queue file replaced; reading it from the start"
            );
            self.file_id = state.id;
            self.offset = 0;
            self.partial.clear();
            self.counters.recreations.fetch_add(1, Ordering::Relaxed);
        }

        let len = state.len;
        if len < self.offset {
            warn!(
                path = %self.path.display(),
                len,
                offset = self.offset,
                "Queue file shrank; starting over"
            );
            self.offset = 0;
            self.partial.clear();
            self.counters
                .external_truncations
                .fetch_add(1, Ordering::Relaxed);
        }
        if len == self.offset {
            self.publish_position();
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).map_err(|source| io_error(&self.path, source))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|source| io_error(&self.path, source))?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut chunk)
            .map_err(|source| io_error(&self.path, source))?;
        self.offset += chunk.len() as u64;

        let records = self.split_lines(&chunk);
        self.publish_position();
        Ok(records)
    }

    /// Appends `chunk` to the held-back partial and parses every complete
    /// line; the trailing incomplete segment stays held back.
    fn split_lines(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        let mut records = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            let line = trim_ascii(line);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(value) => {
                    self.counters.lines_processed.fetch_add(1, Ordering::Relaxed);
                    records.push(value);
                }
                Err(e) => {
                    self.counters.lines_errored.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        bytes = line.len(),
                        "Skipping malformed queue line"
                    );
                }
            }
        }
        records
    }

    /// Rewrites the file so it holds only the held-back partial line.
    ///
    /// Bytes appended since the last read are consumed first. A producer
    /// writing between that final read and the rewrite loses its record.
    fn truncate(&mut self) -> Result<Vec<Value>, QueueError> {
        let late = self.read_new()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| io_error(&self.path, source))?;
        file.write_all(&self.partial)
            .map_err(|source| io_error(&self.path, source))?;

        let before = self.offset;
        self.offset = self.partial.len() as u64;
        self.counters.truncations.fetch_add(1, Ordering::Relaxed);
        self.publish_position();
        info!(
            path = %self.path.display(),
            before,
            kept = self.offset,
            "Queue file truncated"
        );
        Ok(late)
    }

    /// Puts back a queue file that disappeared and starts over at offset 0.
    ///
    /// A held-back partial line belonged to the deleted file and is dropped.
    fn recreate(&mut self) -> Result<(), QueueError> {
        create_queue_file(&self.path)?;
        let state = stat(&self.path).map_err(|source| io_error(&self.path, source))?;
        warn!(
            path = %self.path.display(),
            offset = self.offset,
            dropped_partial = self.partial.len(),
            "Queue file was missing; recreated"
        );
        self.file_id = state.id;
        self.offset = 0;
        self.partial.clear();
        self.counters.recreations.fetch_add(1, Ordering::Relaxed);
        self.publish_position();
        Ok(())
    }

    fn publish_position(&self) {
        self.counters.offset.store(self.offset, Ordering::Relaxed);
        self.counters
            .partial_held
            .store(!self.partial.is_empty(), Ordering::Relaxed);
    }
}

struct FileState {
    len: u64,
    id: Option<(u64, u64)>,
}

fn stat(path: &Path) -> std::io::Result<FileState> {
    let metadata = fs::metadata(path)?;
    Ok(FileState {
        len: metadata.len(),
        id: file_identity(&metadata),
    })
}

#[cfg(unix)]
fn file_identity(metadata: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

fn file_len(path: &Path) -> Result<u64, QueueError> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| io_error(path, source))
}

/// Creates the queue file (and its directory) unless it already exists.
fn create_queue_file(path: &Path) -> Result<(), QueueError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| io_error(path, source))?;
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

// ============================================================================
// Driver
// ============================================================================

/// Runs a [`QueueReader`] until cancelled, forwarding records to the
/// registry.
pub struct QueueWatcher {
    reader: QueueReader,
    config: QueueConfig,
    registry: RegistryHandle,
    cancel: CancellationToken,
}

impl QueueWatcher {
    pub fn new(
        reader: QueueReader,
        config: QueueConfig,
        registry: RegistryHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            config,
            registry,
            cancel,
        }
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        self.reader.counters()
    }

    pub async fn run(mut self) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        // Without a watcher the poll and health check still cover growth.
        let _watcher = match watch(self.reader.path(), wake_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "File notifications unavailable; polling only");
                None
            }
        };

        let debounce = Duration::from_millis(self.config.debounce_ms);
        let health_window = Duration::from_secs(self.config.health_secs.max(1));
        let mut poll = interval(Duration::from_millis(self.config.poll_ms.max(10)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(health_window);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_notified = Instant::now();

        info!(path = %self.reader.path().display(), offset = self.reader.offset(), "Queue reader started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(()) = wake_rx.recv() => {
                    last_notified = Instant::now();
                    sleep(debounce).await;
                    while wake_rx.try_recv().is_ok() {}
                    trace!("Queue notification");
                }
                _ = poll.tick() => {}
                _ = health.tick() => {
                    self.check_health(last_notified, health_window);
                }
            }

            if !self.drain().await {
                break;
            }
        }

        info!(stats = ?self.reader.counters.snapshot(), "Queue reader stopped");
    }

    /// Flags a forced read when the file grew but the watcher has been
    /// quiet for a whole `window`. Returns whether the read was forced.
    fn check_health(&self, last_notified: Instant, window: Duration) -> bool {
        let stalled = last_notified.elapsed() >= window;
        // A missing file counts as unread so the drain recreates it.
        let unread = self.reader.has_unread().unwrap_or(true);
        if stalled && unread {
            warn!("Queue grew without a notification; forcing a read");
            self.reader
                .counters
                .forced_reads
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Reads and forwards; returns false once the registry is gone.
    async fn drain(&mut self) -> bool {
        let records = match self.reader.read_available() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Queue read failed");
                return true;
            }
        };

        for record in records {
            match self.registry.ingest(record, Transport::FileQueue).await {
                Ok(_) => {}
                Err(RegistryError::ChannelClosed) => return false,
                Err(e) => debug!(error = %e, "Queue record rejected"),
            }
        }
        true
    }
}

/// Watches the queue's directory and signals `wake` on changes to the file.
fn watch(path: &Path, wake: mpsc::Sender<()>) -> Result<RecommendedWatcher, QueueError> {
    let target = path.to_path_buf();
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p.file_name() == target.file_name());
            if relevant {
                // A full channel already means "read soon".
                let _ = wake.try_send(());
            }
        }
    })
    .map_err(|source| QueueError::Watch {
        path: dir.clone(),
        source,
    })?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|source| QueueError::Watch { path: dir, source })?;
    Ok(watcher)
}
