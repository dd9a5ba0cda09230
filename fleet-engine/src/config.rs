//! Configuration management for the reconciliation engine.
//!
//! Loads configuration from a TOML file, then applies environment variable
//! overrides (a `.env` file in the working directory is honored).

use crate::utils::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Path to the manifest TOML file
    #[serde(default = "default_manifest_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding host records
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Directory holding private keys, one file per credential reference
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Applies to every command run on an open session
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest payload appended or inserted inline through the shell
    #[serde(default = "default_inline_append_limit")]
    pub inline_append_limit: usize,

    /// Largest payload written inline as a full file
    #[serde(default = "default_inline_write_limit")]
    pub inline_write_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTransport {
    /// curl the service's local health URL through the host session
    Remote,
    /// GET the health endpoint from the orchestrator
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_probe_transport")]
    pub transport: ProbeTransport,

    /// Port of the health endpoint for the direct transport
    #[serde(default = "default_direct_port")]
    pub direct_port: u16,

    #[serde(default = "default_direct_path")]
    pub direct_path: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Hosts reconciled concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches
    #[serde(default = "default_batch_delay")]
    pub batch_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_manifest_path() -> PathBuf {
    PathBuf::from("manifest.toml")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fleet.db")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    120
}

fn default_inline_append_limit() -> usize {
    4 * 1024
}

fn default_inline_write_limit() -> usize {
    40 * 1024
}

fn default_health_attempts() -> u32 {
    6
}

fn default_health_interval() -> u64 {
    5
}

fn default_probe_transport() -> ProbeTransport {
    ProbeTransport::Remote
}

fn default_direct_port() -> u16 {
    8080
}

fn default_direct_path() -> String {
    "/health".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self { path: default_manifest_path() }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            inline_append_limit: default_inline_append_limit(),
            inline_write_limit: default_inline_write_limit(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: default_health_attempts(),
            interval_secs: default_health_interval(),
            transport: default_probe_transport(),
            direct_port: default_direct_port(),
            direct_path: default_direct_path(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl RolloutConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `FLEET_*` / `LOG_LEVEL` environment overrides on top of the file.
    pub fn with_env_overrides(mut self) -> Self {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("FLEET_MANIFEST") {
            self.manifest.path = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_KEYS_DIR") {
            self.ssh.keys_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.rollout.batch_size = v;
        }
        if let Some(v) = get("FLEET_BATCH_DELAY_SECS").and_then(|v| v.parse().ok()) {
            self.rollout.batch_delay_secs = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.transfer.inline_append_limit, 4096);
        assert_eq!(config.transfer.inline_write_limit, 40960);
        assert_eq!(config.health.attempts, 6);
        assert_eq!(config.health.interval(), Duration::from_secs(5));
        assert_eq!(config.health.transport, ProbeTransport::Remote);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[rollout]
batch_size = 12

[health]
transport = "direct"
direct_port = 9090
"#,
        )
        .unwrap();

        assert_eq!(config.rollout.batch_size, 12);
        assert_eq!(config.rollout.batch_delay_secs, 30);
        assert_eq!(config.health.transport, ProbeTransport::Direct);
        assert_eq!(config.health.direct_port, 9090);
        assert_eq!(config.health.direct_path, "/health");
        assert_eq!(config.ssh.command_timeout_secs, 120);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLEET_DB_PATH", "/var/lib/fleet/hosts.db"),
            ("FLEET_BATCH_SIZE", "20"),
            ("FLEET_BATCH_DELAY_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.path, PathBuf::from("/var/lib/fleet/hosts.db"));
        assert_eq!(config.rollout.batch_size, 20);
        assert_eq!(config.rollout.batch_delay_secs, 30);
    }

    #[test]
    fn test_from_file_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[rollout\nbatch_size = 1").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("fleet.toml"));
    }
}
