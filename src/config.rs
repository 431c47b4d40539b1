//! Configuration loading for peerbeam.
//!
//! Configuration is loaded from a TOML file (default: `peerbeam.toml`).
//! Every field has a default so a partial or missing file still yields a
//! working server.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Token size and lifetime configuration.
    #[serde(default)]
    pub keys: KeysConfig,
    /// Rate limiting and disconnect-grace configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum bytes served per unranged (or clamped) stream request
    /// (default: 5 MiB). Streams never serve a whole file in one response.
    #[serde(default = "default_media_chunk_size")]
    pub media_chunk_size: u64,
    /// Length of internal correlation ids (peer ids, transfer ids).
    #[serde(default = "default_internal_id_size")]
    pub internal_id_size: usize,
}

/// Token size and lifetime configuration.
///
/// All of these are bearer capabilities minted with the secure generator.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Session restoration key length (default: 64).
    #[serde(default = "default_session_key_size")]
    pub session_key_size: usize,
    /// Hosted-file token length (default: 16).
    #[serde(default = "default_file_key_size")]
    pub file_key_size: usize,
    /// Download redirect key length (default: 64).
    #[serde(default = "default_download_key_size")]
    pub download_key_size: usize,
    /// Stream redirect key length (default: 64).
    #[serde(default = "default_stream_key_size")]
    pub stream_key_size: usize,
    /// Lifetime of unconsumed redirect keys in seconds (default: 60).
    #[serde(default = "default_download_key_max_age_secs")]
    pub download_key_max_age_secs: u64,
}

/// Rate limiting and disconnect-grace configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Per-IP transferred-byte quota within one reset window
    /// (default: 10 GiB).
    #[serde(default = "default_transfer_limit_bytes")]
    pub transfer_limit_bytes: u64,
    /// Rolling reset window for the byte quota in seconds (default: 3600).
    #[serde(default = "default_transfer_limit_reset_secs")]
    pub transfer_limit_reset_secs: u64,
    /// Grace period after a control-channel disconnect during which the
    /// session can be restored, in seconds (default: 30).
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,
    /// Maximum control-connection attempts per IP per minute (default: 30).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Reaper interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable the cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_media_chunk_size() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_internal_id_size() -> usize {
    12
}

fn default_session_key_size() -> usize {
    64
}

fn default_file_key_size() -> usize {
    16
}

fn default_download_key_size() -> usize {
    64
}

fn default_stream_key_size() -> usize {
    64
}

fn default_download_key_max_age_secs() -> u64 {
    60
}

fn default_transfer_limit_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_transfer_limit_reset_secs() -> u64 {
    3600
}

fn default_disconnect_grace_secs() -> u64 {
    30
}

fn default_connections_per_minute() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            media_chunk_size: default_media_chunk_size(),
            internal_id_size: default_internal_id_size(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            session_key_size: default_session_key_size(),
            file_key_size: default_file_key_size(),
            download_key_size: default_download_key_size(),
            stream_key_size: default_stream_key_size(),
            download_key_max_age_secs: default_download_key_max_age_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            transfer_limit_bytes: default_transfer_limit_bytes(),
            transfer_limit_reset_secs: default_transfer_limit_reset_secs(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
            connections_per_minute: default_connections_per_minute(),
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

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            keys: KeysConfig::default(),
            limits: LimitsConfig::default(),
            cleanup: CleanupConfig::default(),
        }
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
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.server.media_chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.keys.download_key_max_age_secs, 60);
        assert_eq!(config.limits.disconnect_grace_secs, 30);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"
media_chunk_size = 1048576

[keys]
session_key_size = 96
download_key_max_age_secs = 120

[limits]
transfer_limit_bytes = 1073741824
disconnect_grace_secs = 10

[cleanup]
interval_secs = 30
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.server.media_chunk_size, 1048576);
        assert_eq!(config.keys.session_key_size, 96);
        assert_eq!(config.keys.download_key_max_age_secs, 120);
        assert_eq!(config.limits.transfer_limit_bytes, 1073741824);
        assert_eq!(config.limits.disconnect_grace_secs, 10);
        assert_eq!(config.cleanup.interval_secs, 30);
    }

    #[test]
    fn config_missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.keys.file_key_size, 16);
        assert_eq!(config.limits.connections_per_minute, 30);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn config_partial_section_uses_field_defaults() {
        let toml = r#"
[limits]
transfer_limit_reset_secs = 600
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.limits.transfer_limit_reset_secs, 600);
        assert_eq!(config.limits.transfer_limit_bytes, 10 * 1024 * 1024 * 1024);
    }
}
