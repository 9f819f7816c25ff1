//! A durable, append-only, segmented message journal on local disk.
//!
//! The journal buffers serialized messages between a producer stage and a
//! downstream processor: producers [`write`](Journal::write) entries, the
//! processor [`read`](Journal::read)s them in offset order and acknowledges
//! progress with [`mark_offset_committed`](Journal::mark_offset_committed).
//! Background jobs flush dirty segments, checkpoint the recovery point,
//! persist the committed offset and reclaim disk space for segments whose
//! records are both old and already processed.
//!
//! Single-partition, single-process, local-disk only. Not a distributed
//! broker: no replication, compaction, keyed lookup or consumer groups.
//!
//! ```no_run
//! # async fn demo() -> spool_journal::Result<()> {
//! use spool_journal::{Journal, JournalConfig};
//!
//! let journal = Journal::open("/var/lib/spool/journal".as_ref(), JournalConfig::default())?;
//! journal.start();
//!
//! journal.write_entry(&b"message-id"[..], &b"message-body"[..]).await?;
//! for entry in journal.read(100).await? {
//!     // process entry.payload() ...
//!     journal.mark_offset_committed(entry.offset());
//! }
//!
//! journal.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod journal;
pub mod metrics;

mod checkpoint;
mod commit;
mod log;
mod record;
mod retention;
mod scheduler;
mod segment;
mod segments;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JournalConfig;
pub use entry::{Entry, JournalReadEntry, ThrottleState};
pub use error::{Error, Result};
pub use journal::{Journal, COMMITTED_OFFSET_FILE};
pub use metrics::JournalMetrics;
pub use retention::NOTIFY_ON_UTILIZATION_PERCENTAGE;
