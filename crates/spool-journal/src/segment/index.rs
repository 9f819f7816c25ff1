//! Sparse offset index companion to a segment data file.
//!
//! Entries are fixed 8-byte pairs of `(relative_offset: u32, file_position:
//! u32)`, big-endian, sorted by offset. The index is a hint, not a map: a
//! lookup returns the greatest indexed position at or before the target and
//! the caller scans the data file forward from there.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

pub(crate) const INDEX_ENTRY_SIZE: usize = 8;

#[derive(Debug)]
pub(crate) struct OffsetIndex {
    path: PathBuf,
    base_offset: u64,
    file: File,
    /// All entries, loaded plus appended, as (relative_offset, position).
    entries: Vec<(u32, u32)>,
    /// Entries not yet written to the file.
    pending: Vec<(u32, u32)>,
    max_entries: usize,
}

impl OffsetIndex {
    pub(crate) fn open(path: &Path, base_offset: u64, max_index_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut entries = Vec::new();
        let len = file.metadata()?.len() as usize;
        if len > 0 {
            let data = std::fs::read(path)?;
            let mut cursor = 0;
            while cursor + INDEX_ENTRY_SIZE <= data.len() {
                let relative = u32::from_be_bytes(data[cursor..cursor + 4].try_into().unwrap());
                let position =
                    u32::from_be_bytes(data[cursor + 4..cursor + 8].try_into().unwrap());
                entries.push((relative, position));
                cursor += INDEX_ENTRY_SIZE;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            base_offset,
            file,
            entries,
            pending: Vec::new(),
            max_entries: (max_index_size as usize / INDEX_ENTRY_SIZE).max(1),
        })
    }

    /// Greatest indexed `(offset, position)` with offset ≤ `target`.
    pub(crate) fn lookup(&self, target: u64) -> Option<(u64, u32)> {
        if target < self.base_offset {
            return None;
        }
        let relative = match u32::try_from(target - self.base_offset) {
            Ok(r) => r,
            Err(_) => u32::MAX,
        };
        let idx = self
            .entries
            .partition_point(|&(rel, _)| rel <= relative)
            .checked_sub(1)?;
        let (rel, pos) = self.entries[idx];
        Some((self.base_offset + rel as u64, pos))
    }

    pub(crate) fn last_entry(&self) -> Option<(u64, u32)> {
        self.entries
            .last()
            .map(|&(rel, pos)| (self.base_offset + rel as u64, pos))
    }

    /// Records `offset -> position`. Offsets beyond the 32-bit relative range
    /// are silently skipped; the forward scan covers them.
    pub(crate) fn append(&mut self, offset: u64, position: u32) {
        debug_assert!(offset >= self.base_offset);
        let Ok(relative) = u32::try_from(offset - self.base_offset) else {
            return;
        };
        self.entries.push((relative, position));
        self.pending.push((relative, position));
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    /// Writes buffered entries and fsyncs the file.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let mut buf = BytesMut::with_capacity(self.pending.len() * INDEX_ENTRY_SIZE);
            for &(relative, position) in &self.pending {
                buf.put_u32(relative);
                buf.put_u32(position);
            }
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&buf)?;
            self.pending.clear();
        }
        self.file.sync_all().map_err(|source| Error::SyncFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Drops entries for offsets at or beyond `offset` and rewrites the file.
    pub(crate) fn truncate_to(&mut self, offset: u64) -> Result<()> {
        let keep = if offset <= self.base_offset {
            0u32
        } else {
            u32::try_from(offset - self.base_offset).unwrap_or(u32::MAX)
        };
        self.entries.retain(|&(rel, _)| rel < keep);
        self.pending.clear();
        self.rewrite()
    }

    fn rewrite(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.entries.len() * INDEX_ENTRY_SIZE);
        for &(relative, position) in &self.entries {
            buf.put_u32(relative);
            buf.put_u32(position);
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_all().map_err(|source| Error::SyncFailed {
            path: self.path.clone(),
            source,
        })
    }
}
