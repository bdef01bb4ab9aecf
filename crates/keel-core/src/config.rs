//! Centralized configuration for the Keel sync engine.
//!
//! Fixed tuning values live as associated constants on unit structs; the
//! per-deployment knobs are collected in [`SyncOptions`], which can be loaded
//! from a JSON file.

use crate::cache::Strategy;
use crate::error::{KeelError, Result};
use crate::metadata::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("keel/", env!("CARGO_PKG_VERSION"));
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Longest wait for the next chunk of a response body.
    pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
    pub const DEFAULT_MAX_PARALLEL: usize = 1;
}

/// Directory and file names inside an installation.
pub struct PathsConfig;

impl PathsConfig {
    pub const DATA_DIR_NAME: &'static str = ".keel";
    pub const DATABASE_FILENAME: &'static str = "keel.db";
    pub const ARCHIVE_CACHE_FILENAME: &'static str = "archives.json";
    pub const OPTIONS_FILENAME: &'static str = "options.json";
}

/// Cache database tuning.
pub struct CacheConfig;

impl CacheConfig {
    pub const SCHEMA_VERSION: i32 = 1;
    pub const BUSY_TIMEOUT_MS: u32 = 30_000;
    /// Rows per transaction when tracking extracted archive members.
    pub const TRACK_BATCH_SIZE: usize = 500;
    /// Read buffer for content hashing (64 KiB).
    pub const HASH_CHUNK_SIZE: usize = 64 * 1024;
}

/// Per-deployment sync options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Trust level used when comparing tracked files.
    pub strategy: Strategy,
    /// Upper bound on concurrent transfers.
    pub max_parallel: usize,
    /// Drop cache rows for files no longer in the manifest after a stamp.
    pub auto_prune: bool,
    /// Delete pruned files from disk as well as from the cache.
    pub prune_files: bool,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Stall limit between body chunks, not a bound on the whole download.
    pub transfer_timeout_secs: u64,
    /// Directory under the install root holding the database and archive cache.
    pub data_dir_name: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_parallel: NetworkConfig::DEFAULT_MAX_PARALLEL,
            auto_prune: true,
            prune_files: false,
            user_agent: NetworkConfig::USER_AGENT.to_string(),
            connect_timeout_secs: NetworkConfig::CONNECT_TIMEOUT.as_secs(),
            transfer_timeout_secs: NetworkConfig::TRANSFER_TIMEOUT.as_secs(),
            data_dir_name: PathsConfig::DATA_DIR_NAME.to_string(),
        }
    }
}

impl SyncOptions {
    /// Load options from a JSON file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        let options = match atomic_read_json::<SyncOptions>(path)? {
            Some(options) => options,
            None => {
                debug!("No options file at {}, using defaults", path.display());
                SyncOptions::default()
            }
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(KeelError::Config {
                message: "max_parallel must be at least 1".into(),
            });
        }
        if self.data_dir_name.is_empty() || self.data_dir_name.contains(['/', '\\']) {
            return Err(KeelError::Config {
                message: format!("invalid data_dir_name: {:?}", self.data_dir_name),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}
