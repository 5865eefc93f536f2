//! Storage engine configuration.
//!
//! Mirrors the defaults-submodule pattern: a plain `pub const` table backs
//! a `Default` impl, and the whole struct deserializes from a TOML document
//! via `serde`. Durations are parsed with `humantime_serde` so config files
//! can write `"100ms"` instead of a bare integer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod defaults {
    pub const MAX_BUFFER_SIZE: usize = 1 << 30; // 1 GiB
    pub const REGION_SIZE: usize = 1 << 20; // 1 MiB
    pub const SHARD_COUNT: usize = 64;
    pub const SWEEPER_INTERVAL_MS: u64 = 100;
    pub const EPOCH_SLOTS: usize = 1024;
    pub const DEWEY_IDS_STORED: bool = false;
    pub const SLIDING_WINDOW: usize = 4;
    pub const LOG_FORMAT: &str = "plain";

    /// An example configuration file, embedded for `--init-config`-style
    /// tooling and for documentation purposes.
    pub const DEFAULT_CONFIG_FILE: &str = r#"
# max_buffer_size = "1GiB"
# region_size = "1MiB"
# shard_count = 64
# sweeper_interval_ms = 100
# epoch_slots = 1024
# dewey_ids_stored = false
# versioning = "incremental"
# sliding_window = 4
# log_format = "plain"
"#;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningStrategy {
    Full,
    Differential,
    Incremental,
    SlidingSnapshot,
}

impl Default for VersioningStrategy {
    fn default() -> Self {
        VersioningStrategy::Incremental
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_buffer_size: usize,
    pub region_size: usize,
    pub shard_count: usize,
    #[serde(with = "humantime_serde")]
    pub sweeper_interval: Duration,
    pub epoch_slots: usize,
    pub dewey_ids_stored: bool,
    pub versioning: VersioningStrategy,
    pub sliding_window: usize,
    pub log_format: LogFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_buffer_size: defaults::MAX_BUFFER_SIZE,
            region_size: defaults::REGION_SIZE,
            shard_count: defaults::SHARD_COUNT,
            sweeper_interval: Duration::from_millis(defaults::SWEEPER_INTERVAL_MS),
            epoch_slots: defaults::EPOCH_SLOTS,
            dewey_ids_stored: defaults::DEWEY_IDS_STORED,
            versioning: VersioningStrategy::default(),
            sliding_window: defaults::SLIDING_WINDOW,
            log_format: LogFormat::default(),
        }
    }
}

impl StorageConfig {
    /// Parses a TOML document, falling back to defaults for any field the
    /// document omits.
    pub fn parse_toml(text: &str) -> anyhow::Result<StorageConfig> {
        let doc: StorageConfig = toml_edit::de::from_str(text)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Fails fast on configurations the allocator or cache could never
    /// satisfy, rather than surfacing the contradiction as a panic deep
    /// inside a hot allocation path.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.shard_count > 0, "shard_count must be > 0");
        anyhow::ensure!(self.epoch_slots > 0, "epoch_slots must be > 0");
        anyhow::ensure!(
            self.region_size >= crate::alloc::SMALLEST_CLASS,
            "region_size {} smaller than the smallest size class {}",
            self.region_size,
            crate::alloc::SMALLEST_CLASS
        );
        anyhow::ensure!(
            self.region_size % crate::alloc::SMALLEST_CLASS == 0,
            "region_size must be a multiple of the smallest size class"
        );
        if self.versioning == VersioningStrategy::SlidingSnapshot {
            anyhow::ensure!(self.sliding_window > 0, "sliding_window must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_document() {
        let cfg = StorageConfig::parse_toml("shard_count = 8\n").unwrap();
        assert_eq!(cfg.shard_count, 8);
        assert_eq!(cfg.max_buffer_size, defaults::MAX_BUFFER_SIZE);
    }

    #[test]
    fn rejects_region_smaller_than_size_class() {
        let mut cfg = StorageConfig::default();
        cfg.region_size = 1024;
        assert!(cfg.validate().is_err());
    }
}
