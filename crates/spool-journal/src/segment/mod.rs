//! A single on-disk log segment: append-only data file plus sparse index.
//!
//! Segment files are named by their base offset (`{:020}.log` /
//! `{:020}.index`). Only the highest-base segment of a log accepts appends;
//! all others are immutable. The data directory must be exclusive to the
//! owning process; the journal takes a file lock to enforce this.

pub(crate) mod index;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::{DecodeOutcome, Record, LOG_OVERHEAD};
use index::OffsetIndex;

const LOG_SUFFIX: &str = "log";
const INDEX_SUFFIX: &str = "index";
pub(crate) const DELETED_SUFFIX: &str = "deleted";

pub(crate) fn log_file_name(base_offset: u64) -> String {
    format!("{base_offset:020}.{LOG_SUFFIX}")
}

fn deleted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(DELETED_SUFFIX);
    PathBuf::from(name)
}

fn system_time_millis(time: io::Result<std::time::SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

/// Renamed segment files awaiting their grace-period unlink.
#[derive(Debug)]
pub(crate) struct PendingDeletion {
    paths: Vec<PathBuf>,
}

impl PendingDeletion {
    /// Unlinks the renamed files. Missing files are fine; a crash may have
    /// already lost them or a previous purge may have raced us.
    pub(crate) fn purge(&self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to delete {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Segment {
    base_offset: u64,
    log_path: PathBuf,
    index_path: PathBuf,
    /// Buffered append handle. Behind a mutex so read paths can flush
    /// buffered bytes for visibility without `&mut self`.
    writer: Mutex<BufWriter<File>>,
    index: OffsetIndex,
    max_bytes: u64,
    index_interval: u64,
    size: u64,
    /// Offset the next appended record receives; `base_offset` when empty.
    /// For sealed segments this is derived from the neighbouring segment or
    /// a recovery scan.
    next_offset: u64,
    bytes_since_index: u64,
    created_ms: i64,
    last_modified_ms: i64,
}

impl Segment {
    /// Opens (or creates) the segment with the given base offset in `dir`.
    ///
    /// Timestamps for a brand-new segment come from `now_ms`; re-opened
    /// files keep their filesystem timestamps.
    pub(crate) fn open(
        dir: &Path,
        base_offset: u64,
        max_bytes: u64,
        index_interval: u64,
        max_index_size: u64,
        now_ms: i64,
    ) -> Result<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(format!("{base_offset:020}.{INDEX_SUFFIX}"));

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&log_path)?;
        let size = file.seek(SeekFrom::End(0))?;

        let (created_ms, last_modified_ms) = if size == 0 {
            (now_ms, now_ms)
        } else {
            let meta = file.metadata()?;
            let modified = system_time_millis(meta.modified()).unwrap_or(now_ms);
            let created = system_time_millis(meta.created()).unwrap_or(modified);
            (created, modified)
        };

        let index = OffsetIndex::open(&index_path, base_offset, max_index_size)?;

        Ok(Self {
            base_offset,
            log_path,
            index_path,
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            index,
            max_bytes,
            index_interval,
            size,
            next_offset: base_offset,
            bytes_since_index: 0,
            created_ms,
            last_modified_ms,
        })
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset one past the last record, equal to `base_offset` when empty.
    pub(crate) fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn last_offset(&self) -> Option<u64> {
        (self.next_offset > self.base_offset).then(|| self.next_offset - 1)
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub(crate) fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    pub(crate) fn index_is_full(&self) -> bool {
        self.index.is_full()
    }

    /// Used when loading a sealed segment whose end is known from its
    /// successor's base offset.
    pub(crate) fn set_next_offset(&mut self, next_offset: u64) {
        self.next_offset = next_offset;
    }

    /// Appends a contiguous run of records with pre-assigned offsets.
    ///
    /// Returns `(first, last)` appended offsets. Fails with `SegmentFull`
    /// when the batch would push a non-empty segment past its size cap; an
    /// empty segment accepts any batch so oversized records make progress.
    pub(crate) fn append(&mut self, records: &[Record], now_ms: i64) -> Result<(u64, u64)> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(f), Some(l)) => (f.offset, l.offset),
            _ => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty record batch",
                )))
            }
        };

        let batch_bytes: u64 = records.iter().map(|r| r.encoded_len() as u64).sum();
        if self.size > 0 && self.size + batch_bytes > self.max_bytes {
            return Err(Error::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        let mut buf = BytesMut::with_capacity(batch_bytes as usize);
        for record in records {
            let position = self.size + buf.len() as u64;
            if position == 0 || self.bytes_since_index >= self.index_interval {
                if let Ok(position) = u32::try_from(position) {
                    self.index.append(record.offset, position);
                }
                self.bytes_since_index = 0;
            }
            self.bytes_since_index += record.encoded_len() as u64;
            record.encode(&mut buf);
        }

        self.writer.lock().write_all(&buf)?;
        self.size += batch_bytes;
        self.next_offset = last + 1;
        self.last_modified_ms = now_ms;
        Ok((first, last))
    }

    /// Reads whole records with offsets in `[start_offset, upper_bound)`,
    /// returning at most `max_bytes` — except that the first record is always
    /// returned whole, so a single oversized record cannot starve a reader.
    pub(crate) fn read(
        &self,
        start_offset: u64,
        max_bytes: usize,
        upper_bound: Option<u64>,
    ) -> Result<Bytes> {
        if start_offset < self.base_offset || start_offset > self.next_offset {
            return Err(Error::OffsetOutOfRange {
                offset: start_offset,
                log_start: self.base_offset,
                log_end: self.next_offset,
            });
        }
        if start_offset == self.next_offset || self.size == 0 {
            return Ok(Bytes::new());
        }

        // Buffered appends must be visible to the mapping below.
        self.writer.lock().flush()?;

        let file = File::open(&self.log_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Bytes::new());
        }
        // SAFETY: read-only mapping over a file only ever appended to by this
        // process; every slice access below is bounds checked first.
        let mmap = unsafe { Mmap::map(&file)? };

        let mut pos = self
            .index
            .lookup(start_offset)
            .map(|(_, position)| position as usize)
            .filter(|&p| p < mmap.len())
            .unwrap_or(0);

        let mut slice_start = None;
        let mut slice_end = pos;
        let mut collected = 0usize;

        // The index is sparse and possibly stale, so always scan forward.
        while let Some((offset, end)) = read_frame_header(&mmap, pos) {
            if upper_bound.is_some_and(|upper| offset >= upper) {
                break;
            }
            if offset >= start_offset {
                let record_len = end - pos;
                if slice_start.is_some() && collected + record_len > max_bytes {
                    break;
                }
                if slice_start.is_none() {
                    slice_start = Some(pos);
                }
                collected += record_len;
                slice_end = end;
                if collected >= max_bytes {
                    break;
                }
            }
            pos = end;
        }

        match slice_start {
            Some(start) => Ok(Bytes::copy_from_slice(&mmap[start..slice_end])),
            None => Ok(Bytes::new()),
        }
    }

    /// Flushes buffered appends and fsyncs data and index files.
    pub(crate) fn flush(&mut self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            writer.flush()?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|source| Error::SyncFailed {
                    path: self.log_path.clone(),
                    source,
                })?;
        }
        self.index.flush()
    }

    /// Validates records from the last index entry onward and truncates the
    /// file at the first corrupt or partial record. Returns the number of
    /// bytes dropped. Called on the active segment at startup.
    pub(crate) fn recover(&mut self) -> Result<u64> {
        self.writer.lock().flush()?;

        let file = File::open(&self.log_path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            self.size = 0;
            self.next_offset = self.base_offset;
            self.index.truncate_to(self.base_offset)?;
            return Ok(0);
        }
        // SAFETY: as in `read`; the mapping is dropped before any truncation.
        let mmap = unsafe { Mmap::map(&file)? };

        let hint = self
            .index
            .last_entry()
            .map(|(_, position)| position as usize)
            .filter(|&p| p < mmap.len())
            .unwrap_or(0);

        let (mut valid_end, mut last_offset, mut corruption) = scan_records(&mmap, hint);
        if last_offset.is_none() && hint > 0 {
            // The index hint itself was bad; rescan the whole file.
            (valid_end, last_offset, corruption) = scan_records(&mmap, 0);
        }
        drop(mmap);

        if let Some(reason) = corruption {
            warn!(
                segment = %self.log_path.display(),
                position = valid_end,
                "corrupt record during recovery, truncating: {reason}"
            );
        }

        self.next_offset = match last_offset {
            Some(last) => last + 1,
            None => self.base_offset,
        };

        let truncated = len - valid_end as u64;
        if truncated > 0 {
            self.writer.lock().get_ref().set_len(valid_end as u64)?;
        }
        self.size = valid_end as u64;
        self.index.truncate_to(self.next_offset)?;
        Ok(truncated)
    }

    /// Drops records at and beyond `offset`.
    pub(crate) fn truncate_to(&mut self, offset: u64) -> Result<()> {
        if offset >= self.next_offset {
            return Ok(());
        }
        self.writer.lock().flush()?;

        if offset <= self.base_offset {
            self.writer.lock().get_ref().set_len(0)?;
            self.size = 0;
            self.next_offset = self.base_offset;
            self.bytes_since_index = 0;
            return self.index.truncate_to(self.base_offset);
        }

        let file = File::open(&self.log_path)?;
        // SAFETY: as in `read`; the mapping is dropped before truncation.
        let mmap = unsafe { Mmap::map(&file)? };
        let mut pos = self
            .index
            .lookup(offset)
            .map(|(_, position)| position as usize)
            .filter(|&p| p < mmap.len())
            .unwrap_or(0);
        while let Some((record_offset, end)) = read_frame_header(&mmap, pos) {
            if record_offset >= offset {
                break;
            }
            pos = end;
        }
        drop(mmap);

        self.writer.lock().get_ref().set_len(pos as u64)?;
        self.size = pos as u64;
        self.next_offset = offset;
        self.bytes_since_index = 0;
        self.index.truncate_to(offset)
    }

    /// Renames the segment files with a `.deleted` suffix so in-flight reads
    /// drain safely; the returned handle performs the actual unlink after the
    /// configured grace period.
    pub(crate) fn mark_deleted(self) -> Result<PendingDeletion> {
        let log_deleted = deleted_path(&self.log_path);
        let index_deleted = deleted_path(&self.index_path);
        std::fs::rename(&self.log_path, &log_deleted)?;
        std::fs::rename(&self.index_path, &index_deleted)?;
        Ok(PendingDeletion {
            paths: vec![log_deleted, index_deleted],
        })
    }
}

/// Parses `(offset, frame_end)` of the record at `pos`, or `None` when the
/// slice ends before a whole frame.
fn read_frame_header(data: &[u8], pos: usize) -> Option<(u64, usize)> {
    if pos + LOG_OVERHEAD > data.len() {
        return None;
    }
    let offset = u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap());
    let body_len = u32::from_be_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
    let end = pos + LOG_OVERHEAD + body_len;
    (end <= data.len()).then_some((offset, end))
}

/// Walks checksum-validated records from `start`, returning the end position
/// of the last valid record, its offset, and the corruption reason if the
/// walk stopped on a bad frame.
fn scan_records(data: &[u8], start: usize) -> (usize, Option<u64>, Option<String>) {
    let mut pos = start;
    let mut last_offset = None;
    loop {
        if pos >= data.len() {
            return (pos, last_offset, None);
        }
        match Record::decode_at(data, pos) {
            DecodeOutcome::Record { record, next } => {
                last_offset = Some(record.offset);
                pos = next;
            }
            DecodeOutcome::Partial => return (pos, last_offset, None),
            DecodeOutcome::Corrupt { reason } => return (pos, last_offset, Some(reason)),
        }
    }
}
