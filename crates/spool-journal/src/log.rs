//! The append/read engine over an ordered set of segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::checkpoint;
use crate::clock::Clock;
use crate::config::JournalConfig;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::segment::{PendingDeletion, Segment, DELETED_SUFFIX};
use crate::segments::SegmentSet;

pub(crate) const RECOVERY_CHECKPOINT_FILE: &str = "recovery-point-offset-checkpoint";

#[derive(Debug)]
pub(crate) struct Log {
    dir: PathBuf,
    config: JournalConfig,
    clock: Arc<dyn Clock>,
    segments: SegmentSet,
    /// Offset the next appended record will receive.
    log_end_offset: u64,
    /// Records below this offset are known durable on disk.
    recovery_point: u64,
    last_flush_ms: i64,
}

impl Log {
    /// Opens the log in `dir`, discovering existing segments, recovering the
    /// active one and loading the recovery-point checkpoint.
    pub(crate) fn open(dir: &Path, config: JournalConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        remove_stale_deleted_files(dir);

        let now = clock.now_millis();
        let mut bases = discover_segment_bases(dir)?;
        bases.sort_unstable();

        let mut segments = SegmentSet::new();
        for (i, &base) in bases.iter().enumerate() {
            let mut segment = open_segment(dir, base, &config, now)?;
            if let Some(&next_base) = bases.get(i + 1) {
                segment.set_next_offset(next_base);
            }
            segments.insert(segment);
        }

        if segments.is_empty() {
            segments.insert(open_segment(dir, 0, &config, now)?);
        } else {
            let truncated = segments.active_mut().recover()?;
            if truncated > 0 {
                warn!(
                    "recovery truncated {truncated} bytes from the tail of {}",
                    dir.display()
                );
            }
        }

        let log_end_offset = segments.active().next_offset();
        let recovery_point = checkpoint::read(&dir.join(RECOVERY_CHECKPOINT_FILE))
            .unwrap_or(0)
            .min(log_end_offset);

        info!(
            "opened log at {} with {} segment(s), offsets [{}, {})",
            dir.display(),
            segments.len(),
            segments.first().map(Segment::base_offset).unwrap_or(0),
            log_end_offset
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            clock,
            segments,
            log_end_offset,
            recovery_point,
            last_flush_ms: now,
        })
    }

    pub(crate) fn log_start_offset(&self) -> u64 {
        self.segments.first().map(Segment::base_offset).unwrap_or(0)
    }

    pub(crate) fn log_end_offset(&self) -> u64 {
        self.log_end_offset
    }

    pub(crate) fn recovery_point(&self) -> u64 {
        self.recovery_point
    }

    pub(crate) fn unflushed_messages(&self) -> u64 {
        self.log_end_offset - self.recovery_point
    }

    pub(crate) fn last_flush_ms(&self) -> i64 {
        self.last_flush_ms
    }

    /// Journal size in bytes, data files only.
    pub(crate) fn size(&self) -> u64 {
        self.segments.iter().map(Segment::size).sum()
    }

    pub(crate) fn number_of_segments(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub(crate) fn oldest_segment_created_ms(&self) -> i64 {
        self.segments
            .iter()
            .map(Segment::created_ms)
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Appends a batch, assigning contiguous offsets starting at the current
    /// end of the log. The whole batch lands or the call fails; a batch that
    /// does not fit the active segment is split across one or more rolls.
    ///
    /// Returns the offsets of the first and last appended record.
    pub(crate) fn append(&mut self, entries: &[Entry]) -> Result<(u64, u64)> {
        if entries.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot append an empty batch",
            )));
        }

        let first_offset = self.log_end_offset;
        let records: Vec<Record> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                Record::new(
                    first_offset + i as u64,
                    Some(entry.key().clone()),
                    entry.payload().clone(),
                )
            })
            .collect();

        if let Err(e) = self.append_chunks(&records) {
            // The batch is all-or-nothing: undo whatever landed before the
            // failure so offsets stay dense.
            warn!("append failed mid-batch, rolling back to offset {first_offset}: {e}");
            self.log_end_offset = self.segments.active().next_offset();
            match self.truncate_to(first_offset) {
                Ok(pending) => pending.iter().for_each(PendingDeletion::purge),
                Err(rollback) => {
                    error!("rollback of failed append also failed: {rollback}");
                }
            }
            return Err(e);
        }

        self.log_end_offset = first_offset + records.len() as u64;
        let last_offset = self.log_end_offset - 1;

        if self.unflushed_messages() >= self.config.flush_interval_messages {
            debug!(
                "unflushed message count reached {}, flushing",
                self.unflushed_messages()
            );
            self.flush()?;
        }

        Ok((first_offset, last_offset))
    }

    /// Reads whole records from the segment containing `start_offset`,
    /// bounded by `max_bytes` and the exclusive `upper_bound`. Callers read
    /// across segments by advancing their cursor and calling again.
    pub(crate) fn read(
        &self,
        start_offset: u64,
        max_bytes: usize,
        upper_bound: Option<u64>,
    ) -> Result<Bytes> {
        if start_offset == self.log_end_offset {
            return Ok(Bytes::new());
        }
        let log_start = self.log_start_offset();
        if start_offset < log_start || start_offset > self.log_end_offset {
            return Err(Error::OffsetOutOfRange {
                offset: start_offset,
                log_start,
                log_end: self.log_end_offset,
            });
        }
        let segment = self
            .segments
            .find(start_offset)
            .ok_or(Error::OffsetOutOfRange {
                offset: start_offset,
                log_start,
                log_end: self.log_end_offset,
            })?;
        segment.read(start_offset, max_bytes, upper_bound)
    }

    fn append_chunks(&mut self, records: &[Record]) -> Result<()> {
        let mut remaining = records;
        while !remaining.is_empty() {
            self.maybe_roll(&remaining[0])?;

            let capacity = self
                .config
                .segment_bytes
                .saturating_sub(self.segments.active().size());
            let take = fit_records(remaining, capacity);
            let (chunk, rest) = remaining.split_at(take);

            let now = self.clock.now_millis();
            match self.segments.active_mut().append(chunk, now) {
                Ok(_) => remaining = rest,
                Err(e) if e.is_segment_full() => {
                    // Sizing disagreed with the segment; force a roll and
                    // retry the same chunk.
                    self.roll()?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fsyncs the active segment, advances the recovery point to the log end
    /// and stamps the flush time.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.segments.active_mut().flush()?;
        self.recovery_point = self.log_end_offset;
        self.last_flush_ms = self.clock.now_millis();
        Ok(())
    }

    /// Dirty-log check driven by the background flusher.
    pub(crate) fn flush_if_dirty(&mut self) -> Result<()> {
        let dirty_ms = self.clock.now_millis() - self.last_flush_ms;
        if self.unflushed_messages() > 0 && dirty_ms >= self.config.flush_age.as_millis() as i64 {
            debug!(
                "log dirty for {dirty_ms}ms with {} unflushed messages, flushing",
                self.unflushed_messages()
            );
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn write_recovery_checkpoint(&self) -> Result<()> {
        checkpoint::write(&self.dir.join(RECOVERY_CHECKPOINT_FILE), self.recovery_point)
    }

    /// Discards every record at and beyond `offset`. Segments entirely above
    /// the cut are deleted; the new tail is truncated in place. Truncating
    /// past the end of the log is an `OffsetOutOfRange` error.
    pub(crate) fn truncate_to(&mut self, offset: u64) -> Result<Vec<PendingDeletion>> {
        if offset > self.log_end_offset {
            return Err(Error::OffsetOutOfRange {
                offset,
                log_start: self.log_start_offset(),
                log_end: self.log_end_offset,
            });
        }
        if offset == self.log_end_offset {
            return Ok(Vec::new());
        }
        info!(
            "truncating log from {} to {offset}",
            self.log_end_offset
        );

        let mut pending = Vec::new();
        if offset <= self.log_start_offset() {
            // Everything goes; restart with a fresh segment based at the cut.
            for segment in self.segments.split_off(0) {
                pending.push(segment.mark_deleted()?);
            }
            let now = self.clock.now_millis();
            self.segments
                .insert(open_segment(&self.dir, offset, &self.config, now)?);
        } else {
            for segment in self.segments.split_off(offset) {
                pending.push(segment.mark_deleted()?);
            }
            self.segments.active_mut().truncate_to(offset)?;
        }

        self.log_end_offset = offset;
        self.recovery_point = self.recovery_point.min(offset);
        Ok(pending)
    }

    /// Removes the oldest-first run of sealed segments matching `predicate`,
    /// stopping at the first non-match. The active segment survives even
    /// when it matches, so the log never loses its last segment.
    pub(crate) fn delete_old_segments(
        &mut self,
        predicate: impl FnMut(&Segment) -> bool,
    ) -> Result<(usize, Vec<PendingDeletion>)> {
        let victims = self.segments.remove_prefix_while(predicate);
        let mut pending = Vec::with_capacity(victims.len());
        for segment in victims {
            debug!(
                "deleting segment with base offset {} ({} bytes)",
                segment.base_offset(),
                segment.size()
            );
            pending.push(segment.mark_deleted()?);
        }
        Ok((pending.len(), pending))
    }

    fn maybe_roll(&mut self, next_record: &Record) -> Result<()> {
        let active = self.segments.active();
        if active.is_empty() {
            return Ok(());
        }
        let over_size =
            active.size() + next_record.encoded_len() as u64 > self.config.segment_bytes;
        let over_age = self.clock.now_millis() - active.created_ms()
            >= self.config.segment_age.as_millis() as i64;
        if over_size || over_age || active.index_is_full() {
            self.roll()?;
        }
        Ok(())
    }

    /// Seals the active segment and creates a fresh one based at its end.
    ///
    /// The new base comes from the active segment's next offset rather than
    /// `log_end_offset`, which lags while a split batch is mid-append.
    fn roll(&mut self) -> Result<()> {
        let new_base = self.segments.active().next_offset();
        if self.segments.active().base_offset() == new_base {
            return Ok(()); // the active segment is already fresh
        }
        debug!(
            "rolling segment: new base offset {new_base}, {} segment(s) before roll",
            self.segments.len()
        );
        self.segments.active_mut().flush()?;
        let now = self.clock.now_millis();
        self.segments
            .insert(open_segment(&self.dir, new_base, &self.config, now)?);
        Ok(())
    }
}

fn open_segment(dir: &Path, base: u64, config: &JournalConfig, now_ms: i64) -> Result<Segment> {
    Segment::open(
        dir,
        base,
        config.segment_bytes,
        config.index_interval_bytes,
        config.max_index_size,
        now_ms,
    )
}

/// Number of leading records fitting into `capacity` bytes, always ≥ 1 so an
/// oversized record still makes progress in a fresh segment.
fn fit_records(records: &[Record], capacity: u64) -> usize {
    let mut accumulated = 0u64;
    let mut take = 0;
    for record in records {
        let len = record.encoded_len() as u64;
        if take > 0 && accumulated + len > capacity {
            break;
        }
        accumulated += len;
        take += 1;
    }
    take.max(1)
}

fn discover_segment_bases(dir: &Path) -> Result<Vec<u64>> {
    let mut bases = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "log") {
            if let Some(base) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                bases.push(base);
            }
        }
    }
    Ok(bases)
}

/// Clears `*.deleted` leftovers from a crash mid-retention.
fn remove_stale_deleted_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        if path.extension().is_some_and(|ext| ext == DELETED_SUFFIX) {
            debug!("removing stale deleted file {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cannot remove stale file {}: {}", path.display(), e);
            }
        }
    }
}
