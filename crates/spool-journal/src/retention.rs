//! Policy-driven deletion of old segments.
//!
//! Three passes run in fixed order per sweep: by age, by total size, by
//! committed offset. Each pass removes an oldest-first prefix of sealed
//! segments, so offset contiguity holds and the active segment survives.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::commit::DEFAULT_COMMITTED_OFFSET;
use crate::config::JournalConfig;
use crate::error::Result;
use crate::log::Log;
use crate::segment::PendingDeletion;

/// Utilization threshold above which a warning is logged.
pub const NOTIFY_ON_UTILIZATION_PERCENTAGE: f64 = 95.0;

pub(crate) fn utilization_percent(size: u64, retention_bytes: i64) -> f64 {
    if retention_bytes > 0 {
        (size as f64) * 100.0 / (retention_bytes as f64)
    } else {
        0.0
    }
}

/// Outcome of one retention sweep.
#[derive(Debug, Default)]
pub(crate) struct RetentionSweep {
    /// Total segments deleted across the three passes.
    pub deleted_segments: usize,
    /// Renamed files awaiting their delayed unlink.
    pub pending: Vec<PendingDeletion>,
}

#[derive(Debug)]
pub(crate) struct RetentionManager {
    config: JournalConfig,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub(crate) fn new(config: JournalConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Runs the three passes and returns what was deleted. The caller holds
    /// the log's writer lock and schedules the deferred unlinks.
    pub(crate) fn run(&self, log: &mut Log, committed_offset: i64) -> Result<RetentionSweep> {
        debug!("beginning log cleanup");
        let mut sweep = RetentionSweep::default();

        for pass in [
            self.cleanup_expired_segments(log)?,
            self.cleanup_to_maintain_size(log)?,
            self.cleanup_committed(log, committed_offset)?,
        ] {
            let (deleted, pending) = pass;
            sweep.deleted_segments += deleted;
            sweep.pending.extend(pending);
        }

        debug!(
            "log cleanup completed, {} segment(s) deleted",
            sweep.deleted_segments
        );
        Ok(sweep)
    }

    /// Pass 1: drop sealed segments idle for longer than the retention age.
    fn cleanup_expired_segments(&self, log: &mut Log) -> Result<(usize, Vec<PendingDeletion>)> {
        let now = self.clock.now_millis();
        let retention_ms = self.config.retention_age.as_millis() as i64;
        log.delete_old_segments(|segment| {
            let age_ms = now - segment.last_modified_ms();
            let expired = age_ms > retention_ms;
            if expired {
                debug!(
                    "[cleanup-age] removing segment with age {}s, over the retention age {}s",
                    age_ms / 1000,
                    retention_ms / 1000
                );
            }
            expired
        })
    }

    /// Pass 2: shrink the log back under `retention_bytes`, oldest first.
    fn cleanup_to_maintain_size(&self, log: &mut Log) -> Result<(usize, Vec<PendingDeletion>)> {
        let retention_bytes = self.config.retention_bytes;
        let size = log.size();

        let utilization = utilization_percent(size, retention_bytes);
        if utilization > NOTIFY_ON_UTILIZATION_PERCENTAGE {
            warn!(
                "journal utilization ({utilization:.0}%) has gone over \
                 {NOTIFY_ON_UTILIZATION_PERCENTAGE:.0}%"
            );
        }

        if retention_bytes < 0 || (size as i64) < retention_bytes {
            return Ok((0, Vec::new()));
        }

        let mut diff = size as i64 - retention_bytes;
        log.delete_old_segments(|segment| {
            let segment_size = segment.size() as i64;
            if diff - segment_size >= 0 {
                diff -= segment_size;
                debug!(
                    "[cleanup-size] removing segment at base offset {}, size {} bytes, \
                     target size {retention_bytes}",
                    segment.base_offset(),
                    segment.size()
                );
                true
            } else {
                false
            }
        })
    }

    /// Pass 3: drop segments whose every offset is already committed.
    ///
    /// A segment containing any offset ≥ the committed offset is kept; with
    /// fewer than two segments there is nothing safe to delete.
    fn cleanup_committed(
        &self,
        log: &mut Log,
        committed_offset: i64,
    ) -> Result<(usize, Vec<PendingDeletion>)> {
        if log.number_of_segments() <= 1 {
            debug!(
                "[cleanup-committed] journal is already minimal at {} segment(s)",
                log.number_of_segments()
            );
            return Ok((0, Vec::new()));
        }
        if committed_offset == DEFAULT_COMMITTED_OFFSET {
            return Ok((0, Vec::new()));
        }

        log.delete_old_segments(|segment| {
            let fully_committed = segment
                .last_offset()
                .and_then(|last| i64::try_from(last).ok())
                .is_some_and(|last| last < committed_offset);
            if fully_committed {
                debug!(
                    "[cleanup-committed] segment at base offset {} is prior to committed \
                     offset {committed_offset}",
                    segment.base_offset()
                );
            }
            fully_committed
        })
    }
}
