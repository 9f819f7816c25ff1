use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the journal.
///
/// All sizes are in bytes. `retention_bytes` may be negative to disable the
/// size-based retention pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Soft cap on a segment data file before the log rolls.
    pub segment_bytes: u64,

    /// Soft cap on the active segment's wall-clock age before the log rolls.
    pub segment_age: Duration,

    /// Force an fsync after this many unflushed appends.
    pub flush_interval_messages: u64,

    /// Force an fsync when the log has been dirty at least this long.
    pub flush_age: Duration,

    /// Approximate total journal size the retention sweep shrinks towards.
    /// Negative disables size-based retention.
    pub retention_bytes: i64,

    /// Maximum age of a sealed segment before the retention sweep deletes it.
    pub retention_age: Duration,

    /// Period of the dirty-log flusher job.
    pub flush_check_interval: Duration,

    /// Period of the recovery-checkpoint writer job.
    pub flush_checkpoint_interval: Duration,

    /// Period of the retention sweep job.
    pub retention_check_interval: Duration,

    /// Grace period between marking a segment deleted and unlinking it.
    pub file_delete_delay: Duration,

    /// Approximate number of record bytes between sparse index entries.
    pub index_interval_bytes: u64,

    /// Hard cap on an index file; a full index forces a roll.
    pub max_index_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 100 * 1024 * 1024,
            segment_age: Duration::from_secs(60 * 60),
            flush_interval_messages: 1_000_000,
            flush_age: Duration::from_secs(60),
            retention_bytes: 5 * 1024 * 1024 * 1024,
            retention_age: Duration::from_secs(12 * 60 * 60),
            flush_check_interval: Duration::from_secs(60),
            flush_checkpoint_interval: Duration::from_secs(60),
            retention_check_interval: Duration::from_secs(60),
            file_delete_delay: Duration::from_secs(60),
            index_interval_bytes: 4096,
            max_index_size: 1024 * 1024,
        }
    }
}

impl JournalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_bytes(mut self, segment_bytes: u64) -> Self {
        self.segment_bytes = segment_bytes;
        self
    }

    pub fn with_segment_age(mut self, segment_age: Duration) -> Self {
        self.segment_age = segment_age;
        self
    }

    pub fn with_flush_interval_messages(mut self, messages: u64) -> Self {
        self.flush_interval_messages = messages;
        self
    }

    pub fn with_flush_age(mut self, flush_age: Duration) -> Self {
        self.flush_age = flush_age;
        self
    }

    pub fn with_retention_bytes(mut self, retention_bytes: i64) -> Self {
        self.retention_bytes = retention_bytes;
        self
    }

    pub fn with_retention_age(mut self, retention_age: Duration) -> Self {
        self.retention_age = retention_age;
        self
    }

    pub fn with_file_delete_delay(mut self, delay: Duration) -> Self {
        self.file_delete_delay = delay;
        self
    }

    /// Validates the configuration. Called on journal startup; a bad
    /// configuration refuses to start.
    pub fn validate(&self) -> Result<()> {
        if self.segment_bytes == 0 {
            return Err(Error::ConfigInvalid("segment_bytes must be > 0".into()));
        }
        if self.flush_interval_messages == 0 {
            return Err(Error::ConfigInvalid(
                "flush_interval_messages must be > 0".into(),
            ));
        }
        if self.index_interval_bytes == 0 {
            return Err(Error::ConfigInvalid(
                "index_interval_bytes must be > 0".into(),
            ));
        }
        if self.max_index_size < crate::segment::index::INDEX_ENTRY_SIZE as u64 {
            return Err(Error::ConfigInvalid(format!(
                "max_index_size must hold at least one {}-byte entry",
                crate::segment::index::INDEX_ENTRY_SIZE
            )));
        }
        if self.retention_age.is_zero() {
            return Err(Error::ConfigInvalid("retention_age must be > 0".into()));
        }
        for (name, period) in [
            ("flush_check_interval", self.flush_check_interval),
            ("flush_checkpoint_interval", self.flush_checkpoint_interval),
            ("retention_check_interval", self.retention_check_interval),
        ] {
            if period.is_zero() {
                return Err(Error::ConfigInvalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = JournalConfig::default();
        config.validate().unwrap();
        assert_eq!(config.segment_bytes, 100 * 1024 * 1024);
        assert_eq!(config.index_interval_bytes, 4096);
        assert_eq!(config.max_index_size, 1024 * 1024);
        assert_eq!(config.file_delete_delay, Duration::from_secs(60));
    }

    #[test]
    fn builder_pattern() {
        let config = JournalConfig::new()
            .with_segment_bytes(1024)
            .with_retention_bytes(-1)
            .with_segment_age(Duration::from_secs(5));

        assert_eq!(config.segment_bytes, 1024);
        assert_eq!(config.retention_bytes, -1);
        assert_eq!(config.segment_age, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn zero_segment_bytes_is_rejected() {
        let config = JournalConfig::new().with_segment_bytes(0);
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn zero_flush_interval_is_rejected() {
        let config = JournalConfig::new().with_flush_interval_messages(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn serialization_round_trip() {
        let config = JournalConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: JournalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.segment_bytes, config.segment_bytes);
        assert_eq!(parsed.retention_bytes, config.retention_bytes);
    }
}
