//! Journal metrics.
//!
//! Uses the `metrics` crate facade for backend-agnostic instrumentation; the
//! process decides which recorder (if any) to install. `JournalMetrics` is a
//! collaborator handed to the journal so components never reach for a
//! registry of their own.
//!
//! All metrics follow the pattern `journal_{name}_{unit}`.

use std::time::Instant;

/// Counter, histogram and gauge emission for one journal instance.
#[derive(Debug, Default, Clone)]
pub struct JournalMetrics;

/// Point-in-time gauge values, assembled under the log lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JournalStats {
    pub size: u64,
    pub log_end_offset: u64,
    pub segments: usize,
    pub unflushed_messages: u64,
    pub uncommitted_messages: u64,
    pub recovery_point: u64,
    pub last_flush_ms: i64,
    pub oldest_segment_ms: i64,
    pub utilization_percent: f64,
}

impl JournalMetrics {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn add_messages_written(&self, count: u64) {
        metrics::counter!("journal_messages_written_total").increment(count);
    }

    pub(crate) fn add_messages_read(&self, count: u64) {
        metrics::counter!("journal_messages_read_total").increment(count);
    }

    pub(crate) fn record_write_time_us(&self, micros: u64) {
        metrics::histogram!("journal_write_time_microseconds").record(micros as f64);
    }

    pub(crate) fn record_read_time_us(&self, micros: u64) {
        metrics::histogram!("journal_read_time_microseconds").record(micros as f64);
    }

    pub(crate) fn update_gauges(&self, stats: &JournalStats) {
        metrics::gauge!("journal_size_bytes").set(stats.size as f64);
        metrics::gauge!("journal_log_end_offset").set(stats.log_end_offset as f64);
        metrics::gauge!("journal_segments").set(stats.segments as f64);
        metrics::gauge!("journal_unflushed_messages").set(stats.unflushed_messages as f64);
        metrics::gauge!("journal_uncommitted_messages").set(stats.uncommitted_messages as f64);
        metrics::gauge!("journal_recovery_point").set(stats.recovery_point as f64);
        metrics::gauge!("journal_last_flush_time_ms").set(stats.last_flush_ms as f64);
        metrics::gauge!("journal_oldest_segment_ms").set(stats.oldest_segment_ms as f64);
        metrics::gauge!("journal_utilization_percent").set(stats.utilization_percent);
    }
}

/// Wall-clock stopwatch for operation latencies.
pub(crate) struct Timer {
    start: Instant,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}
