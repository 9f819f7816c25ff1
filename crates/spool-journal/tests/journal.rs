//! End-to-end journal scenarios against real temp directories.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use spool_journal::{Entry, Journal, JournalConfig, JournalMetrics, ManualClock};

fn open_with_clock(dir: &Path, config: JournalConfig, clock: Arc<ManualClock>) -> Journal {
    Journal::open_with(dir, config, clock, JournalMetrics::new()).unwrap()
}

fn no_retention_config() -> JournalConfig {
    JournalConfig::default()
        .with_retention_bytes(-1)
        .with_retention_age(Duration::from_secs(365 * 24 * 3600))
}

/// Builds a journal whose sealed segments hold exactly `batch` offsets each:
/// appends `batches * batch` entries, forcing an age-based roll between
/// batches by advancing the clock past the segment age.
async fn journal_with_segments(
    dir: &Path,
    config: JournalConfig,
    clock: Arc<ManualClock>,
    batches: u64,
    batch: u64,
) -> Journal {
    let config = config.with_segment_age(Duration::from_secs(10));
    let journal = open_with_clock(dir, config, clock.clone());
    for b in 0..batches {
        let entries: Vec<Entry> = (b * batch..(b + 1) * batch)
            .map(|i| Entry::new(format!("id-{i}"), format!("message-{i}")))
            .collect();
        journal.write(entries).await.unwrap();
        clock.advance(Duration::from_secs(11));
    }
    journal
}

#[tokio::test]
async fn basic_write_read() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let journal = open_with_clock(dir.path(), no_retention_config(), clock);

    let last = journal
        .write(vec![
            Journal::create_entry("a", "A"),
            Journal::create_entry("b", "B"),
            Journal::create_entry("c", "C"),
        ])
        .await
        .unwrap();
    assert_eq!(last, 2);

    let entries = journal.read_from(0, 10).await.unwrap();
    assert_eq!(entries.len(), 3);
    let payloads: Vec<&Bytes> = entries.iter().map(|e| e.payload()).collect();
    assert_eq!(payloads, vec![&Bytes::from("A"), &Bytes::from("B"), &Bytes::from("C")]);
    let offsets: Vec<u64> = entries.iter().map(|e| e.offset()).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
}

#[tokio::test]
async fn segment_roll_on_size() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let config = no_retention_config().with_segment_bytes(128);
    let journal = open_with_clock(dir.path(), config, clock);

    for i in 0..20u64 {
        journal
            .write_entry(format!("k{i:02}"), vec![b'x'; 16])
            .await
            .unwrap();
    }

    assert!(journal.number_of_segments().await >= 2);
    assert_eq!(journal.log_end_offset().await, 20);

    let entries = journal.read_from(0, 100).await.unwrap();
    assert_eq!(entries.len(), 20);
    let offsets: Vec<u64> = entries.iter().map(|e| e.offset()).collect();
    assert_eq!(offsets, (0..20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn retention_by_age_deletes_sealed_segments() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let config = JournalConfig::default()
        .with_retention_bytes(-1)
        .with_retention_age(Duration::from_secs(60));

    // two sealed segments plus an active one
    let journal = journal_with_segments(dir.path(), config, clock.clone(), 3, 5).await;
    assert_eq!(journal.number_of_segments().await, 3);

    // everything sealed is now well past the retention age
    clock.advance(Duration::from_secs(120));
    let deleted = journal.cleanup_logs().await;

    assert_eq!(deleted, 2);
    assert_eq!(journal.purged_segments_in_last_retention(), 2);
    assert_eq!(journal.number_of_segments().await, 1);
    assert_eq!(journal.log_start_offset().await, 10);
    assert_eq!(journal.log_end_offset().await, 15);
}

#[tokio::test]
async fn retention_respects_committed_offset() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    // sealed segments covering [0..9], [10..19], [20..29] and an active [30..)
    let journal =
        journal_with_segments(dir.path(), no_retention_config(), clock.clone(), 4, 10).await;
    assert_eq!(journal.number_of_segments().await, 4);

    journal.mark_offset_committed(15);
    let deleted = journal.cleanup_logs().await;

    // only the fully-committed [0..9] segment goes; [10..19] still holds
    // uncommitted offsets 16..19
    assert_eq!(deleted, 1);
    assert_eq!(journal.log_start_offset().await, 10);
    assert_eq!(journal.log_end_offset().await, 40);
}

#[tokio::test]
async fn read_past_start_clamps_to_log_start() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let journal =
        journal_with_segments(dir.path(), no_retention_config(), clock.clone(), 4, 10).await;

    journal.mark_offset_committed(15);
    journal.cleanup_logs().await;
    assert_eq!(journal.log_start_offset().await, 10);

    // offset 5 was retention-deleted: the read logs an error and restarts
    // from the beginning of the journal
    let entries = journal.read_from(5, 100).await.unwrap();
    assert_eq!(entries[0].offset(), 10);
    assert_eq!(entries.len(), 30);
    assert_eq!(journal.next_read_offset(), 40);
}

#[tokio::test]
async fn crash_recovery_preserves_flushed_records() {
    let dir = TempDir::new().unwrap();
    {
        let journal = Journal::open(dir.path(), no_retention_config()).unwrap();
        journal.start();

        let entries: Vec<Entry> = (0..100)
            .map(|i| Entry::new(format!("id-{i}"), format!("message-{i}")))
            .collect();
        journal.write(entries).await.unwrap();
        journal.flush().await.unwrap();
        journal.mark_offset_committed(49);

        // let the offset persister tick at least once, then "crash" by
        // dropping the journal without a clean shutdown
        tokio::time::sleep(Duration::from_millis(2_500)).await;
    }

    let journal = Journal::open(dir.path(), no_retention_config()).unwrap();
    assert_eq!(journal.log_end_offset().await, 100);
    assert_eq!(journal.committed_offset(), 49);
    assert_eq!(journal.next_read_offset(), 50);

    let entries = journal.read(1000).await.unwrap();
    assert_eq!(entries.len(), 50);
    assert_eq!(entries[0].offset(), 50);
    assert_eq!(entries[0].payload(), &Bytes::from("message-50"));

    // the full prefix is still there for offset-addressed reads
    let all = journal.read_from(0, 1000).await.unwrap();
    assert_eq!(all.len(), 100);
}

#[tokio::test]
async fn offsets_stay_contiguous_across_rolls_and_retention() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let journal =
        journal_with_segments(dir.path(), no_retention_config(), clock.clone(), 6, 7).await;

    journal.mark_offset_committed(30);
    journal.cleanup_logs().await;

    let start = journal.log_start_offset().await;
    let end = journal.log_end_offset().await;
    assert!(start > 0);

    let entries = journal.read_from(start, 1000).await.unwrap();
    let offsets: Vec<u64> = entries.iter().map(|e| e.offset()).collect();
    assert_eq!(offsets, (start..end).collect::<Vec<u64>>());
}

#[tokio::test]
async fn reads_are_idempotent_for_a_fixed_log_state() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let journal =
        journal_with_segments(dir.path(), no_retention_config(), clock.clone(), 3, 5).await;

    let first = journal.read_from(3, 8).await.unwrap();
    let second = journal.read_from(3, 8).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
    assert_eq!(first[0].offset(), 3);
}

#[tokio::test]
async fn round_trip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let journal = open_with_clock(dir.path(), no_retention_config(), clock);

    let payloads: Vec<Bytes> = (0..50)
        .map(|i| Bytes::from((0..i).map(|b| b as u8).collect::<Vec<u8>>()))
        .collect();
    for (i, payload) in payloads.iter().enumerate() {
        journal
            .write_entry(format!("id-{i}"), payload.clone())
            .await
            .unwrap();
    }

    let entries = journal.read_from(0, 100).await.unwrap();
    assert_eq!(entries.len(), payloads.len());
    for (entry, expected) in entries.iter().zip(&payloads) {
        assert_eq!(entry.payload(), expected);
    }
}

#[tokio::test]
async fn retention_never_deletes_the_only_segment() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let config = JournalConfig::default()
        .with_retention_bytes(16) // absurdly small cap
        .with_retention_age(Duration::from_secs(1));
    let journal = open_with_clock(dir.path(), config, clock.clone());

    journal.write_entry("k", "p").await.unwrap();
    journal.mark_offset_committed(0);
    clock.advance(Duration::from_secs(3600));

    journal.cleanup_logs().await;
    assert_eq!(journal.number_of_segments().await, 1);
    assert_eq!(journal.log_end_offset().await, 1);
}

#[tokio::test]
async fn deleted_segment_files_are_renamed_then_purged() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let config = JournalConfig::default()
        .with_retention_bytes(-1)
        .with_retention_age(Duration::from_secs(60))
        .with_file_delete_delay(Duration::from_millis(50));
    let journal = journal_with_segments(dir.path(), config, clock.clone(), 3, 5).await;

    clock.advance(Duration::from_secs(120));
    assert_eq!(journal.cleanup_logs().await, 2);

    // renamed immediately, unlinked after the grace period
    let deleted_markers = || {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "deleted"))
            .count()
    };
    assert!(deleted_markers() > 0);
    assert!(!dir.path().join("00000000000000000000.log").exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(deleted_markers(), 0);
}
