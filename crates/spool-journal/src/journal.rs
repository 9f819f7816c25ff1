//! The journal façade: public write/read/commit API, lifecycle and the four
//! background jobs.
//!
//! Producers append serialized messages; the processor reads them in order
//! and acknowledges progress by committing a read offset. Segments whose
//! records are both old and committed are reclaimed by the retention sweep.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fs2::FileExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::commit::{CommitTracker, DEFAULT_COMMITTED_OFFSET};
use crate::config::JournalConfig;
use crate::entry::{Entry, JournalReadEntry, ThrottleState};
use crate::error::{Error, Result};
use crate::log::Log;
use crate::metrics::{JournalMetrics, JournalStats, Timer};
use crate::record::{RecordIter, MAX_FIELD_LEN};
use crate::retention::{utilization_percent, RetentionManager, RetentionSweep};
use crate::scheduler::spawn_periodic;
use crate::segment::PendingDeletion;

/// Sidecar file holding the committed read offset, decimal ASCII.
pub const COMMITTED_OFFSET_FILE: &str = "graylog2-committed-read-offset";

const LOCK_FILE: &str = ".lock";

/// Upper bound on the bytes a single read call pulls from disk.
const READ_CAP_BYTES: usize = 5 * 1024 * 1024;

const JOB_INITIAL_DELAY: Duration = Duration::from_secs(30);
const OFFSET_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

struct Shared {
    config: JournalConfig,
    log: tokio::sync::RwLock<Log>,
    committed: CommitTracker,
    retention: RetentionManager,
    metrics: JournalMetrics,
    next_read_offset: AtomicU64,
    shutting_down: AtomicBool,
    purged_segments_in_last_retention: AtomicUsize,
    throttle: parking_lot::RwLock<Option<ThrottleState>>,
    /// Held for the journal's lifetime; guarantees directory exclusivity.
    _dir_lock: std::fs::File,
}

/// A durable, append-only, segmented message journal on local disk.
pub struct Journal {
    inner: Arc<Shared>,
    jobs: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Journal {
    /// Sentinel committed offset meaning "never committed".
    pub const DEFAULT_COMMITTED_OFFSET: i64 = DEFAULT_COMMITTED_OFFSET;

    /// Opens the journal in `dir` with the system clock. Fails fast on an
    /// invalid configuration or a directory owned by another process.
    pub fn open(dir: &Path, config: JournalConfig) -> Result<Self> {
        Self::open_with(dir, config, Arc::new(SystemClock), JournalMetrics::new())
    }

    /// Opens the journal with an explicit clock and metrics collaborator.
    pub fn open_with(
        dir: &Path,
        config: JournalConfig,
        clock: Arc<dyn Clock>,
        metrics: JournalMetrics,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::LockFailed {
                path: dir.to_path_buf(),
            })?;

        let log = Log::open(dir, config.clone(), clock.clone())?;
        let committed = CommitTracker::load(&dir.join(COMMITTED_OFFSET_FILE))?;
        let next_read_offset = committed.next_read_offset();
        let retention = RetentionManager::new(config.clone(), clock);

        info!("initialized message journal at {}", dir.display());

        Ok(Self {
            inner: Arc::new(Shared {
                config,
                log: tokio::sync::RwLock::new(log),
                committed,
                retention,
                metrics,
                next_read_offset: AtomicU64::new(next_read_offset),
                shutting_down: AtomicBool::new(false),
                purged_segments_in_last_retention: AtomicUsize::new(0),
                throttle: parking_lot::RwLock::new(None),
                _dir_lock: lock_file,
            }),
            jobs: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Schedules the four background jobs: dirty-log flusher, recovery
    /// checkpoint writer, retention sweep and committed-offset persister.
    /// Idempotent; `shutdown` cancels them.
    pub fn start(&self) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            return;
        }

        // Jobs hold weak references so an abandoned journal releases its
        // directory lock as soon as the façade drops.
        let flusher = Arc::downgrade(&self.inner);
        jobs.push(spawn_periodic(
            "dirty-log-flusher",
            JOB_INITIAL_DELAY,
            self.inner.config.flush_check_interval,
            move || {
                let inner = flusher.upgrade();
                async move {
                    match inner {
                        Some(inner) => inner.log.write().await.flush_if_dirty(),
                        None => Ok(()),
                    }
                }
            },
        ));

        let checkpointer = Arc::downgrade(&self.inner);
        jobs.push(spawn_periodic(
            "recovery-checkpoint-flusher",
            JOB_INITIAL_DELAY,
            self.inner.config.flush_checkpoint_interval,
            move || {
                let inner = checkpointer.upgrade();
                async move {
                    match inner {
                        Some(inner) => inner.log.read().await.write_recovery_checkpoint(),
                        None => Ok(()),
                    }
                }
            },
        ));

        let cleaner = Arc::downgrade(&self.inner);
        jobs.push(spawn_periodic(
            "log-retention-cleaner",
            JOB_INITIAL_DELAY,
            self.inner.config.retention_check_interval,
            move || {
                let inner = cleaner.upgrade();
                async move {
                    match inner {
                        Some(inner) => inner.run_retention().await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            },
        ));

        let persister = Arc::downgrade(&self.inner);
        jobs.push(spawn_periodic(
            "offset-file-flusher",
            OFFSET_PERSIST_INTERVAL,
            OFFSET_PERSIST_INTERVAL,
            move || {
                let inner = persister.upgrade();
                async move {
                    match inner {
                        Some(inner) => inner.committed.persist(),
                        None => Ok(()),
                    }
                }
            },
        ));
    }

    /// Cooperative shutdown: cancels the jobs, fsyncs the active segment,
    /// writes the recovery checkpoint and persists the committed offset one
    /// last time. In-flight reads observe the flag and return empty batches.
    pub async fn shutdown(&self) {
        debug!("shutting down journal");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }

        {
            let mut log = self.inner.log.write().await;
            if let Err(e) = log.flush() {
                error!("cannot flush log during shutdown: {e}");
            }
            if let Err(e) = log.write_recovery_checkpoint() {
                error!("cannot write recovery checkpoint during shutdown: {e}");
            }
        }
        if let Err(e) = self.inner.committed.persist() {
            error!("cannot persist committed offset during shutdown: {e}");
        }
        info!("journal shut down");
    }

    /// Creates an opaque entry for a bulk [`write`](Self::write).
    pub fn create_entry(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Entry {
        Entry::new(key, payload)
    }

    /// Writes a batch of entries and returns the offset of the last one.
    /// The batch is appended atomically: offsets are contiguous and no other
    /// producer's records interleave.
    pub async fn write(&self, entries: Vec<Entry>) -> Result<u64> {
        for entry in &entries {
            let largest = entry.key().len().max(entry.payload().len());
            if largest > MAX_FIELD_LEN {
                return Err(Error::EntryTooLarge { size: largest });
            }
        }

        let timer = Timer::new();
        let count = entries.len() as u64;
        let payload_bytes: usize = entries.iter().map(|e| e.payload().len()).sum();

        let (first_offset, last_offset) = self.inner.log.write().await.append(&entries)?;

        self.inner.metrics.add_messages_written(count);
        self.inner
            .metrics
            .record_write_time_us(timer.elapsed_us());
        debug!(
            "wrote {count} messages to journal: {payload_bytes} payload bytes, log positions \
             {first_offset} to {last_offset}"
        );
        Ok(last_offset)
    }

    /// Writes a single entry and returns its offset.
    pub async fn write_entry(
        &self,
        key: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        self.write(vec![Entry::new(key, payload)]).await
    }

    /// Reads up to `max_count` entries from the internal cursor.
    pub async fn read(&self, max_count: u64) -> Result<Vec<JournalReadEntry>> {
        let offset = self.inner.next_read_offset.load(Ordering::SeqCst);
        self.read_from(offset, max_count).await
    }

    /// Reads up to `max(1, max_count)` entries starting at `from_offset`,
    /// capped at 5 MiB of record data, advancing the internal cursor past
    /// the last decoded record.
    ///
    /// An offset before the start of the log (the consumer fell behind a
    /// retention sweep) is clamped up to `log_start_offset` with an error
    /// log. An offset past the end yields an empty batch.
    pub async fn read_from(
        &self,
        from_offset: u64,
        max_count: u64,
    ) -> Result<Vec<JournalReadEntry>> {
        let max_count = max_count.max(1);
        let mut entries = Vec::new();
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Ok(entries);
        }

        let timer = Timer::new();
        let log = self.inner.log.read().await;

        let mut offset = from_offset;
        let log_start = log.log_start_offset();
        if offset < log_start {
            error!(
                "read offset {offset} before start of log at {log_start}, starting to read \
                 from the beginning of the journal"
            );
            offset = log_start;
        }
        let max_offset = offset.saturating_add(max_count);
        debug!(
            "requesting to read a maximum of {max_count} messages (or 5MB) from the journal, \
             offset interval [{offset}, {max_offset})"
        );

        let mut budget = READ_CAP_BYTES;
        'fill: while (entries.len() as u64) < max_count && budget > 0 && offset < max_offset {
            let data = match log.read(offset, budget, Some(max_offset)) {
                Ok(data) => data,
                Err(Error::OffsetOutOfRange { .. }) => {
                    warn!("offset out of range, no messages available starting at offset {offset}");
                    break;
                }
                Err(e) => {
                    if self.inner.shutting_down.load(Ordering::SeqCst) {
                        debug!("ignoring read error during shutdown: {e}");
                        return Ok(Vec::new());
                    }
                    return Err(e);
                }
            };
            if data.is_empty() {
                break;
            }

            let mut iter = RecordIter::new(&data);
            let mut progressed = false;
            for record in iter.by_ref() {
                budget = budget.saturating_sub(record.encoded_len());
                offset = record.offset + 1;
                progressed = true;
                entries.push(JournalReadEntry::new(record.payload, record.offset));
                if entries.len() as u64 >= max_count {
                    break 'fill;
                }
            }
            if let Some(reason) = iter.corruption() {
                warn!("stopped reading at corrupt record near offset {offset}: {reason}");
                break;
            }
            if !progressed {
                break;
            }
        }
        drop(log);

        if let Some(last) = entries.last() {
            self.inner
                .next_read_offset
                .store(last.offset() + 1, Ordering::SeqCst);
            debug!(
                "read {} messages from journal, offset interval [{}, {}]",
                entries.len(),
                entries[0].offset(),
                last.offset()
            );
        } else {
            debug!("no messages available to read for offset interval [{from_offset}, {max_offset})");
        }

        self.inner.metrics.add_messages_read(entries.len() as u64);
        self.inner.metrics.record_read_time_us(timer.elapsed_us());
        Ok(entries)
    }

    /// Marks the given offset as durably processed by the downstream
    /// consumer. Monotonic and lock-free; a background job persists the
    /// value to the sidecar file every second.
    pub fn mark_offset_committed(&self, offset: u64) {
        self.inner.committed.mark_committed(offset);
    }

    /// The highest committed offset, or
    /// [`DEFAULT_COMMITTED_OFFSET`](Self::DEFAULT_COMMITTED_OFFSET).
    pub fn committed_offset(&self) -> i64 {
        self.inner.committed.get()
    }

    /// The offset the next cursor-based [`read`](Self::read) starts from.
    pub fn next_read_offset(&self) -> u64 {
        self.inner.next_read_offset.load(Ordering::SeqCst)
    }

    /// The first valid offset in the journal.
    pub async fn log_start_offset(&self) -> u64 {
        self.inner.log.read().await.log_start_offset()
    }

    /// The offset the next appended record will receive.
    pub async fn log_end_offset(&self) -> u64 {
        self.inner.log.read().await.log_end_offset()
    }

    /// Journal size in bytes, excluding index files.
    pub async fn size(&self) -> u64 {
        self.inner.log.read().await.size()
    }

    pub async fn number_of_segments(&self) -> usize {
        self.inner.log.read().await.number_of_segments()
    }

    /// Discards all records at and beyond `offset`.
    pub async fn truncate_to(&self, offset: u64) -> Result<()> {
        let pending = self.inner.log.write().await.truncate_to(offset)?;
        self.inner.schedule_purges(pending);
        Ok(())
    }

    /// Runs a retention sweep outside the scheduled cadence and returns the
    /// number of deleted segments.
    pub async fn cleanup_logs(&self) -> usize {
        match self.inner.run_retention().await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!("unable to delete expired segments: {e}");
                0
            }
        }
    }

    /// Segments deleted by the most recent retention sweep, summed across
    /// its three passes.
    pub fn purged_segments_in_last_retention(&self) -> usize {
        self.inner
            .purged_segments_in_last_retention
            .load(Ordering::SeqCst)
    }

    pub fn throttle_state(&self) -> Option<ThrottleState> {
        *self.inner.throttle.read()
    }

    pub fn set_throttle_state(&self, state: ThrottleState) {
        *self.inner.throttle.write() = Some(state);
    }

    /// Flushes the active segment to disk immediately.
    pub async fn flush(&self) -> Result<()> {
        self.inner.log.write().await.flush()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }
    }
}

impl Shared {
    async fn run_retention(&self) -> Result<usize> {
        let committed = self.committed.get();
        let sweep = {
            let mut log = self.log.write().await;
            let sweep = self.retention.run(&mut log, committed)?;
            self.refresh_gauges(&log, committed);
            sweep
        };

        let RetentionSweep {
            deleted_segments,
            pending,
        } = sweep;
        self.purged_segments_in_last_retention
            .store(deleted_segments, Ordering::SeqCst);
        self.schedule_purges(pending);
        Ok(deleted_segments)
    }

    /// Defers the unlink of renamed segment files so in-flight reads drain.
    fn schedule_purges(&self, pending: Vec<PendingDeletion>) {
        let delay = self.config.file_delete_delay;
        for deletion in pending {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                deletion.purge();
            });
        }
    }

    fn refresh_gauges(&self, log: &Log, committed: i64) {
        let log_end = log.log_end_offset();
        self.metrics.update_gauges(&JournalStats {
            size: log.size(),
            log_end_offset: log_end,
            segments: log.number_of_segments(),
            unflushed_messages: log.unflushed_messages(),
            uncommitted_messages: uncommitted_count(log_end, committed),
            recovery_point: log.recovery_point(),
            last_flush_ms: log.last_flush_ms(),
            oldest_segment_ms: log.oldest_segment_created_ms(),
            utilization_percent: utilization_percent(log.size(), self.config.retention_bytes),
        });
    }
}

/// Entries written but not yet committed: `max(0, log_end - 1 - committed)`,
/// with the sentinel treated as "nothing committed".
fn uncommitted_count(log_end_offset: u64, committed: i64) -> u64 {
    let committed = if committed == DEFAULT_COMMITTED_OFFSET {
        -1
    } else {
        committed
    };
    (log_end_offset as i64 - 1 - committed).max(0) as u64
}
