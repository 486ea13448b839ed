//! Configuration management for seglog
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (SEGLOG_* prefix, highest precedence)
//! 2. seglog.local.toml (gitignored, local overrides)
//! 3. seglog.toml (git-tracked, project config)
//! 4. ~/.config/seglog/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main seglog configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeglogConfig {
    pub storage: StorageConfig,
    pub compaction: CompactionConfig,
}

/// Settings for segment files, their index and cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory new segments are created in.
    pub data_dir: PathBuf,
    /// Bytes appended between two sparse index entries.
    pub index_step_bytes: u64,
    /// Whether append-capable segments keep a batch cache.
    pub cache_enabled: bool,
    /// Upper bound on bytes held by one segment's batch cache.
    pub cache_max_bytes: usize,
    /// Appender buffer size before bytes are handed to the file.
    pub write_behind_bytes: usize,
    /// Read buffer size for data streams.
    pub read_buffer_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".seglog/data"),
            index_step_bytes: 32 * 1024,
            cache_enabled: true,
            cache_max_bytes: 4 * 1024 * 1024,
            write_behind_bytes: 64 * 1024,
            read_buffer_bytes: 128 * 1024,
        }
    }
}

/// Settings for the key compaction passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Budget, in key bytes, for the deduplication map.
    pub key_map_max_memory_bytes: usize,
    /// Seed for the eviction RNG. `None` seeds from the OS.
    pub eviction_seed: Option<u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            key_map_max_memory_bytes: 5 * 1024 * 1024,
            eviction_seed: None,
        }
    }
}

impl SeglogConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without merging other sources
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the storage layer cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.index_step_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.index_step_bytes must be positive".to_string(),
            ));
        }
        if self.storage.write_behind_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.write_behind_bytes must be positive".to_string(),
            ));
        }
        if self.storage.read_buffer_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.read_buffer_bytes must be positive".to_string(),
            ));
        }
        if self.compaction.key_map_max_memory_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "compaction.key_map_max_memory_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = base.join(&self.storage.data_dir);
        }
    }
}
