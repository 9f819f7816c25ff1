use bytes::Bytes;

/// A single entry handed to the journal for writing.
///
/// The key is opaque to the journal (typically a message id); the payload is
/// the serialized message. Both are limited to `i32::MAX` bytes by the
/// 32-bit length prefixes of the on-disk record format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    key: Bytes,
    payload: Bytes,
}

impl Entry {
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// An entry read back from the journal, tagged with its offset.
///
/// Consumers acknowledge progress by passing the highest fully-processed
/// offset to `Journal::mark_offset_committed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReadEntry {
    payload: Bytes,
    offset: u64,
}

impl JournalReadEntry {
    pub(crate) fn new(payload: Bytes, offset: u64) -> Self {
        Self { payload, offset }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Snapshot of journal pressure, published for external backpressure
/// deciders. The journal stores and serves it but never consumes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleState {
    /// Entries written but not yet committed by the processor.
    pub uncommitted_entries: u64,
    /// Creation timestamp of the oldest retained segment, millis since epoch.
    pub oldest_segment_ms: i64,
    /// `100 * size / retention_bytes`, or 0 when size retention is disabled.
    pub utilization_percent: f64,
    /// Total journal size in bytes, data files only.
    pub journal_size: u64,
    /// Configured retention size cap in bytes.
    pub journal_size_limit: i64,
}
