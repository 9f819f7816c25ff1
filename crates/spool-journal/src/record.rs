//! On-disk record framing.
//!
//! Records are length-prefixed and self-delimiting, so segments are plain
//! concatenations with no escaping:
//!
//! ```text
//! offset          : u64 big-endian
//! total_length    : u32 big-endian    length of all fields below
//! crc32           : u32 big-endian    over attributes..payload
//! attributes      : u8                reserved, zero
//! key_length      : u32 big-endian    0xFFFF_FFFF encodes a null key
//! key             : key_length bytes
//! payload_length  : u32 big-endian
//! payload         : payload_length bytes
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

/// Bytes preceding the checksummed body: offset + total_length.
pub(crate) const LOG_OVERHEAD: usize = 12;

/// Fixed body bytes besides key and payload: crc + attributes + two lengths.
pub(crate) const BODY_OVERHEAD: usize = 13;

/// Sentinel key length encoding a null key.
const NULL_KEY_LENGTH: u32 = u32::MAX;

/// Hard cap on a single key or payload, mirroring the 32-bit length prefix.
pub(crate) const MAX_FIELD_LEN: usize = i32::MAX as usize;

/// A single journal record with its assigned offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// Result of attempting to decode one record from a byte slice.
#[derive(Debug)]
pub(crate) enum DecodeOutcome {
    /// A whole, checksum-valid record; `next` is the byte just past it.
    Record { record: Record, next: usize },
    /// The slice ends mid-record. Benign at a segment tail.
    Partial,
    /// Framing or checksum failure.
    Corrupt { reason: String },
}

impl Record {
    pub(crate) fn new(offset: u64, key: Option<Bytes>, payload: Bytes) -> Self {
        Self {
            offset,
            key,
            payload,
        }
    }

    fn key_len(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len())
    }

    /// Total on-disk size of this record, including the log overhead.
    pub(crate) fn encoded_len(&self) -> usize {
        LOG_OVERHEAD + BODY_OVERHEAD + self.key_len() + self.payload.len()
    }

    /// Appends the framed record to `buf`.
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let body_len = BODY_OVERHEAD + self.key_len() + self.payload.len();

        let mut hasher = Hasher::new();
        hasher.update(&[0u8]); // attributes
        match &self.key {
            Some(key) => {
                hasher.update(&(key.len() as u32).to_be_bytes());
                hasher.update(key);
            }
            None => hasher.update(&NULL_KEY_LENGTH.to_be_bytes()),
        }
        hasher.update(&(self.payload.len() as u32).to_be_bytes());
        hasher.update(&self.payload);
        let crc = hasher.finalize();

        buf.reserve(LOG_OVERHEAD + body_len);
        buf.put_u64(self.offset);
        buf.put_u32(body_len as u32);
        buf.put_u32(crc);
        buf.put_u8(0);
        match &self.key {
            Some(key) => {
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
            }
            None => buf.put_u32(NULL_KEY_LENGTH),
        }
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Decodes the record starting at `pos` in `data`.
    pub(crate) fn decode_at(data: &[u8], pos: usize) -> DecodeOutcome {
        let rest = &data[pos.min(data.len())..];
        if rest.len() < LOG_OVERHEAD {
            return DecodeOutcome::Partial;
        }

        let offset = u64::from_be_bytes(rest[0..8].try_into().unwrap());
        let body_len = u32::from_be_bytes(rest[8..12].try_into().unwrap()) as usize;
        if body_len < BODY_OVERHEAD {
            return DecodeOutcome::Corrupt {
                reason: format!("record body length {body_len} below minimum {BODY_OVERHEAD}"),
            };
        }
        if rest.len() < LOG_OVERHEAD + body_len {
            return DecodeOutcome::Partial;
        }

        let body = &rest[LOG_OVERHEAD..LOG_OVERHEAD + body_len];
        let stored_crc = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&body[4..]);
        if hasher.finalize() != stored_crc {
            return DecodeOutcome::Corrupt {
                reason: format!("CRC mismatch for offset {offset}"),
            };
        }

        let mut cursor = 5; // past crc + attributes
        let key_len = u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let key = if key_len == NULL_KEY_LENGTH {
            None
        } else {
            let key_len = key_len as usize;
            if body.len() < cursor + key_len + 4 {
                return DecodeOutcome::Corrupt {
                    reason: format!("key length {key_len} overruns record body"),
                };
            }
            let key = Bytes::copy_from_slice(&body[cursor..cursor + key_len]);
            cursor += key_len;
            Some(key)
        };

        let payload_len =
            u32::from_be_bytes(body[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if body.len() != cursor + payload_len {
            return DecodeOutcome::Corrupt {
                reason: format!(
                    "payload length {payload_len} disagrees with record body length {body_len}"
                ),
            };
        }
        let payload = Bytes::copy_from_slice(&body[cursor..]);

        DecodeOutcome::Record {
            record: Record {
                offset,
                key,
                payload,
            },
            next: pos + LOG_OVERHEAD + body_len,
        }
    }
}

/// Iterates whole records in a byte slice, stopping at the first partial or
/// corrupt frame. After exhaustion, `corruption()` reports whether the stop
/// was due to corruption.
pub(crate) struct RecordIter<'a> {
    data: &'a [u8],
    pos: usize,
    corruption: Option<String>,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            corruption: None,
        }
    }

    pub(crate) fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.pos >= self.data.len() || self.corruption.is_some() {
            return None;
        }
        match Record::decode_at(self.data, self.pos) {
            DecodeOutcome::Record { record, next } => {
                self.pos = next;
                Some(record)
            }
            DecodeOutcome::Partial => {
                self.pos = self.data.len();
                None
            }
            DecodeOutcome::Corrupt { reason } => {
                self.corruption = Some(reason);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64, key: &str, payload: &str) -> Record {
        Record::new(
            offset,
            Some(Bytes::copy_from_slice(key.as_bytes())),
            Bytes::copy_from_slice(payload.as_bytes()),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let original = record(42, "id-1", "hello journal");
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf.len(), original.encoded_len());

        match Record::decode_at(&buf, 0) {
            DecodeOutcome::Record { record, next } => {
                assert_eq!(record, original);
                assert_eq!(next, buf.len());
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn null_key_round_trip() {
        let original = Record::new(7, None, Bytes::from_static(b"payload"));
        let mut buf = BytesMut::new();
        original.encode(&mut buf);

        match Record::decode_at(&buf, 0) {
            DecodeOutcome::Record { record, .. } => {
                assert_eq!(record.key, None);
                assert_eq!(record.payload, original.payload);
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn truncated_buffer_is_partial_not_corrupt() {
        let mut buf = BytesMut::new();
        record(0, "k", "a longer payload body").encode(&mut buf);

        for cut in [1, LOG_OVERHEAD - 1, LOG_OVERHEAD + 3, buf.len() - 1] {
            match Record::decode_at(&buf[..cut], 0) {
                DecodeOutcome::Partial => {}
                other => panic!("cut at {cut}: expected partial, got {other:?}"),
            }
        }
    }

    #[test]
    fn bit_flip_is_detected() {
        let mut buf = BytesMut::new();
        record(3, "key", "payload").encode(&mut buf);
        let mut bytes = buf.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        match Record::decode_at(&bytes, 0) {
            DecodeOutcome::Corrupt { reason } => assert!(reason.contains("CRC")),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn iterator_walks_concatenated_records() {
        let mut buf = BytesMut::new();
        for i in 0..5u64 {
            record(i, &format!("k{i}"), &format!("p{i}")).encode(&mut buf);
        }
        // trailing garbage that looks like a partial header
        buf.put_u64(99);

        let mut iter = RecordIter::new(&buf);
        let decoded: Vec<Record> = iter.by_ref().collect();
        assert_eq!(decoded.len(), 5);
        assert!(iter.corruption().is_none());
        for (i, rec) in decoded.iter().enumerate() {
            assert_eq!(rec.offset, i as u64);
            assert_eq!(rec.payload, Bytes::from(format!("p{i}")));
        }
    }

    #[test]
    fn iterator_stops_and_reports_corruption() {
        let mut buf = BytesMut::new();
        record(0, "k0", "p0").encode(&mut buf);
        let valid_len = buf.len();
        record(1, "k1", "p1").encode(&mut buf);
        buf[valid_len + LOG_OVERHEAD + 6] ^= 0x01; // corrupt second record body

        let mut iter = RecordIter::new(&buf);
        let decoded: Vec<Record> = iter.by_ref().collect();
        assert_eq!(decoded.len(), 1);
        assert!(iter.corruption().is_some());
    }
}
