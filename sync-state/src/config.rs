//! Configuration loading for sync-state.
//!
//! Configuration is loaded from a TOML file (default: `sync-state.toml`).
//! Every section and field may be omitted and falls back to its default.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for sync-state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sync cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Sync round configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Long-poll configuration.
    #[serde(default)]
    pub ping: PingConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum pooled connections (default: 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Sync cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Cached copies older than this are reloaded (default: 0 = never).
    #[serde(default)]
    pub max_age_secs: u64,
}

/// Sync round configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Window size used when the client sends none (default: 100).
    #[serde(default = "default_window_size")]
    pub default_window_size: u32,
    /// Upper bound for any window size (default: 512).
    #[serde(default = "default_max_window_size")]
    pub max_window_size: u32,
    /// Presentations of one sync key before the client is assumed to loop
    /// (default: 3).
    #[serde(default = "default_max_synckey_repeats")]
    pub max_synckey_repeats: u32,
    /// Sync keys kept per series by the cleanup task (default: 2).
    #[serde(default = "default_keep_sync_keys")]
    pub keep_sync_keys: u32,
}

/// Long-poll configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Shortest heartbeat accepted (default: 60).
    #[serde(default = "default_heartbeat_min")]
    pub heartbeat_min_secs: u64,
    /// Longest heartbeat accepted (default: 2700).
    #[serde(default = "default_heartbeat_max")]
    pub heartbeat_max_secs: u64,
    /// Heartbeat used when the client sends none (default: 480).
    #[serde(default = "default_heartbeat_default")]
    pub heartbeat_default_secs: u64,
    /// Pause between backend polls (default: 10).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("sync-state.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_window_size() -> u32 {
    100
}

fn default_max_window_size() -> u32 {
    512
}

fn default_max_synckey_repeats() -> u32 {
    3
}

fn default_keep_sync_keys() -> u32 {
    2
}

fn default_heartbeat_min() -> u64 {
    60
}

fn default_heartbeat_max() -> u64 {
    2700 // 45 minutes
}

fn default_heartbeat_default() -> u64 {
    480
}

fn default_poll_interval() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_window_size: default_window_size(),
            max_window_size: default_max_window_size(),
            max_synckey_repeats: default_max_synckey_repeats(),
            keep_sync_keys: default_keep_sync_keys(),
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            heartbeat_min_secs: default_heartbeat_min(),
            heartbeat_max_secs: default_heartbeat_max(),
            heartbeat_default_secs: default_heartbeat_default(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl PingConfig {
    /// Clamp a requested heartbeat into the accepted range.
    ///
    /// `None` selects the default heartbeat.
    pub fn clamp_heartbeat(&self, requested: Option<u64>) -> u64 {
        match requested {
            None => self.heartbeat_default_secs,
            Some(secs) => secs.clamp(self.heartbeat_min_secs, self.heartbeat_max_secs),
        }
    }

    /// Pause between backend polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.storage.database, PathBuf::from("sync-state.db"));
        assert_eq!(config.sync.default_window_size, 100);
        assert_eq!(config.sync.max_window_size, 512);
        assert_eq!(config.sync.max_synckey_repeats, 3);
        assert_eq!(config.ping.heartbeat_default_secs, 480);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[storage]
database = "/data/state.db"
max_connections = 10

[cache]
max_age_secs = 300

[sync]
max_window_size = 256

[ping]
heartbeat_max_secs = 1200

[cleanup]
interval_secs = 1800
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.database, PathBuf::from("/data/state.db"));
        assert_eq!(config.storage.max_connections, 10);
        assert_eq!(config.cache.max_age_secs, 300);
        assert_eq!(config.sync.max_window_size, 256);
        assert_eq!(config.sync.default_window_size, 100);
        assert_eq!(config.ping.heartbeat_max_secs, 1200);
        assert_eq!(config.cleanup.interval_secs, 1800);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.keep_sync_keys, 2);
        assert_eq!(config.ping.poll_interval_secs, 10);
        assert_eq!(config.cache.max_age_secs, 0);
    }

    #[test]
    fn heartbeat_is_clamped() {
        let ping = PingConfig::default();
        assert_eq!(ping.clamp_heartbeat(None), 480);
        assert_eq!(ping.clamp_heartbeat(Some(5)), 60);
        assert_eq!(ping.clamp_heartbeat(Some(9000)), 2700);
        assert_eq!(ping.clamp_heartbeat(Some(600)), 600);
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/sync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-state.toml");
        std::fs::write(&path, "[sync]\ndefault_window_size = 25\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.default_window_size, 25);
    }
}
