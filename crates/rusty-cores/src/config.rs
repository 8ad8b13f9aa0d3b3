// File: rusty-cores/src/config.rs
// Purpose: Engine configuration parsing from rusty-cores.toml

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conflict::SyncStrategy;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub offline: OfflineConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Sync worker and heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Heartbeat interval in seconds (default: 120)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the doubling of the base delay
    #[serde(default = "default_max_backoff_multiplier")]
    pub max_backoff_multiplier: u32,

    /// Upper bound of the random jitter added to each retry, in milliseconds
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Attempts before an update is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout applied to every remote call, in milliseconds
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    #[serde(default)]
    pub strategy: SyncStrategy,
}

/// Cache backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// "memory" or "filesystem"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Directory used by the filesystem backend
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

/// Offline queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// sqlx SQLite URL; use a file URL for durability across restarts
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

/// Throttled change notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Leak detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Subscriptions or tasks older than this are reported as leaks
    #[serde(default = "default_max_resource_age_secs")]
    pub max_resource_age_secs: u64,
}

// Default values
fn default_interval_secs() -> u64 {
    120
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_backoff_multiplier() -> u32 {
    8
}

fn default_max_jitter_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_remote_timeout_ms() -> u64 {
    10_000
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".rusty-cores/cache")
}

fn default_database_url() -> String {
    "sqlite://.rusty-cores/offline.db?mode=rwc".to_string()
}

fn default_min_interval_ms() -> u64 {
    50
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_resource_age_secs() -> u64 {
    600
}

// Default implementations
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_backoff_multiplier: default_max_backoff_multiplier(),
            max_jitter_ms: default_max_jitter_ms(),
            max_attempts: default_max_attempts(),
            remote_timeout_ms: default_remote_timeout_ms(),
            strategy: SyncStrategy::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            path: default_cache_path(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_resource_age_secs: default_max_resource_age_secs(),
        }
    }
}

impl SyncConfig {
    /// Heartbeat period, never zero
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

impl EventsConfig {
    /// Broadcast buffer size, never zero
    pub fn capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

impl NotifyConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl DiagnosticsConfig {
    pub fn max_resource_age(&self) -> Duration {
        Duration::from_secs(self.max_resource_age_secs)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Missing file means defaults
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.sync.interval_secs > 0, "sync.interval_secs must be at least 1");
        ensure!(self.sync.max_attempts > 0, "sync.max_attempts must be at least 1");
        ensure!(self.sync.remote_timeout_ms > 0, "sync.remote_timeout_ms must be at least 1");
        ensure!(self.events.channel_capacity > 0, "events.channel_capacity must be at least 1");
        Ok(())
    }

    /// Load configuration from default path (./rusty-cores.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("rusty-cores.toml")
    }
}
