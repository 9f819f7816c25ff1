//! The committed-read-offset tracker and its sidecar file.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{error, warn};

use crate::error::Result;

/// Sentinel meaning "nothing has ever been committed".
pub const DEFAULT_COMMITTED_OFFSET: i64 = i64::MIN;

/// Tracks the highest journal offset the downstream processor has durably
/// handled. Monotonic: concurrent callers can never drive it backwards.
///
/// The value is persisted as decimal ASCII in a single-line sidecar file,
/// rewritten in place by a background job. Losing up to one persist interval
/// of commit progress is acceptable because re-reading is idempotent.
#[derive(Debug)]
pub(crate) struct CommitTracker {
    committed: AtomicI64,
    path: PathBuf,
}

impl CommitTracker {
    /// Loads the tracker from `path`, starting at the sentinel when the file
    /// is absent or empty.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let committed = match File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                match contents.lines().next().map(str::trim) {
                    Some(line) if !line.is_empty() => match line.parse::<i64>() {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(
                                "unparseable committed offset {line:?} in {}: {e}, starting fresh",
                                path.display()
                            );
                            DEFAULT_COMMITTED_OFFSET
                        }
                    },
                    _ => DEFAULT_COMMITTED_OFFSET,
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // created on first startup, rewritten in place from then on
                File::create(path)?;
                DEFAULT_COMMITTED_OFFSET
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            committed: AtomicI64::new(committed),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn get(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// First offset the reader should resume from after a restart.
    pub(crate) fn next_read_offset(&self) -> u64 {
        let committed = self.get();
        if committed == DEFAULT_COMMITTED_OFFSET {
            0
        } else {
            committed.saturating_add(1).max(0) as u64
        }
    }

    /// Advances the committed offset to `max(current, offset)`.
    ///
    /// Lock-free CAS loop; offsets at or below the current value are silently
    /// ignored. Spinning more than a handful of times means unreasonable
    /// contention on what should be a single consumer, so warn.
    pub(crate) fn mark_committed(&self, offset: u64) {
        let offset = offset.min(i64::MAX as u64) as i64;
        let mut spins = 0u32;
        let mut current = self.committed.load(Ordering::SeqCst);
        loop {
            let updated = current.max(offset);
            match self.committed.compare_exchange(
                current,
                updated,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => {
                    current = observed;
                    spins += 1;
                    if spins % 10 == 0 {
                        warn!(
                            "committing journal offset has spun {spins} times, \
                             this might be a bug; continuing to retry"
                        );
                    }
                }
            }
        }
    }

    /// Writes the committed offset to the sidecar file and fsyncs it.
    ///
    /// A no-op while nothing has been committed. An fsync failure is logged
    /// and tolerated; the next tick retries.
    pub(crate) fn persist(&self) -> Result<()> {
        let committed = self.get();
        if committed == DEFAULT_COMMITTED_OFFSET {
            return Ok(());
        }

        let mut file = File::create(&self.path)?;
        file.write_all(committed.to_string().as_bytes())?;
        file.flush()?;
        if let Err(e) = file.sync_all() {
            error!(
                "cannot sync {} to disk, continuing; the file may not be durable: {e}",
                self.path.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> CommitTracker {
        CommitTracker::load(&dir.path().join("committed-read-offset")).unwrap()
    }

    #[test]
    fn starts_at_sentinel() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        assert_eq!(tracker.get(), DEFAULT_COMMITTED_OFFSET);
        assert_eq!(tracker.next_read_offset(), 0);
    }

    #[test]
    fn commits_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);

        tracker.mark_committed(10);
        assert_eq!(tracker.get(), 10);

        tracker.mark_committed(5);
        assert_eq!(tracker.get(), 10);

        tracker.mark_committed(11);
        assert_eq!(tracker.get(), 11);
        assert_eq!(tracker.next_read_offset(), 12);
    }

    #[test]
    fn persist_skips_while_uncommitted() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.persist().unwrap();

        // the sidecar is created on first startup but stays empty until
        // something is committed
        let contents = std::fs::read_to_string(dir.path().join("committed-read-offset")).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let tracker = tracker(&dir);
            tracker.mark_committed(42);
            tracker.persist().unwrap();
        }
        let reloaded = tracker(&dir);
        assert_eq!(reloaded.get(), 42);
        assert_eq!(reloaded.next_read_offset(), 43);
    }

    #[test]
    fn garbage_sidecar_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("committed-read-offset");
        std::fs::write(&path, "not a number\n").unwrap();

        let tracker = CommitTracker::load(&path).unwrap();
        assert_eq!(tracker.get(), DEFAULT_COMMITTED_OFFSET);
    }

    #[test]
    fn concurrent_commits_converge_to_max() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(tracker(&dir));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        tracker.mark_committed(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.get(), 7_999);
    }
}
