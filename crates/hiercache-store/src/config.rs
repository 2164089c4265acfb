//! Cache configuration.
//!
//! Hosts usually build a [`CacheConfig`] in code; a TOML file with the
//! same field names can be loaded instead. Every field has a default, so
//! an empty document is a valid configuration.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 90_000;
pub const DEFAULT_LOCK_WAIT_MS: u64 = 200;
pub const DEFAULT_HOT_CACHE_CAPACITY: usize = 10;
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_OPTIMIZE_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for disk stores. Defaults to the source file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub kind: StoreKind,
    /// Disk budget in bytes; `0` disables eviction.
    #[serde(default)]
    pub size_limit: u64,
    /// SQLite page cache budget in bytes; `0` keeps the SQLite default.
    #[serde(default)]
    pub memory_cache_limit: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_hot_cache_capacity")]
    pub hot_cache_capacity: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Node count above which a bulk write is followed by `PRAGMA optimize`.
    #[serde(default = "default_optimize_threshold")]
    pub optimize_threshold: u64,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_lock_wait_ms() -> u64 {
    DEFAULT_LOCK_WAIT_MS
}

fn default_hot_cache_capacity() -> usize {
    DEFAULT_HOT_CACHE_CAPACITY
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_optimize_threshold() -> u64 {
    DEFAULT_OPTIMIZE_THRESHOLD
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            kind: StoreKind::Disk,
            size_limit: 0,
            memory_cache_limit: 0,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            hot_cache_capacity: DEFAULT_HOT_CACHE_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            optimize_threshold: DEFAULT_OPTIMIZE_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn memory() -> Self {
        Self {
            kind: StoreKind::Memory,
            ..Self::default()
        }
    }

    pub fn disk(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CacheError> {
        let config: Self =
            toml::from_str(text).map_err(|e| CacheError::Config(format!("invalid toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        Self::from_toml_str(&text)
            .map_err(|e| CacheError::Config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.lock_wait_ms == 0 {
            return Err(CacheError::Config("lock_wait_ms must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(CacheError::Config("page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CacheConfig::from_toml_str("").expect("empty toml is valid");
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(90));
        assert_eq!(config.lock_wait(), Duration::from_millis(200));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = CacheConfig::from_toml_str(
            r#"
kind = "memory"
size_limit = 1048576
page_size = 2
"#,
        )
        .expect("config should parse");
        assert_eq!(config.kind, StoreKind::Memory);
        assert_eq!(config.size_limit, 1_048_576);
        assert_eq!(config.page_size, 2);
        assert_eq!(config.hot_cache_capacity, DEFAULT_HOT_CACHE_CAPACITY);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = CacheConfig::from_toml_str("page_size = 0").expect_err("must reject");
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(CacheConfig::from_toml_str(r#"kind = "tape""#).is_err());
    }
}
