//! Configuration resolution for buildgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/buildgate/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`BUILDGATE_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial: a file only overrides the keys it contains.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete buildgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
}

/// gRPC listener and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Artifact storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the local artifact store.
    pub data_dir: PathBuf,
    pub bucket: String,
    /// Key prefix for uploaded build contexts.
    pub upload_destination_dir: String,
    /// Storage-side expiry applied to every upload.
    pub artifact_lifetime_secs: u64,
    /// How often expired artifacts are swept.
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bucket: "buildgate-uploads".to_string(),
            upload_destination_dir: "userdata".to_string(),
            artifact_lifetime_secs: 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue the job is published to; also prefixes the log channel name.
    pub queue_name: String,
    /// CPU architecture the workers build for.
    pub architecture: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_name: "rai_docker".to_string(),
            architecture: "ppc64le".to_string(),
        }
    }
}

/// Per-session relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of the ordered queue feeding the outbound stream.
    pub queue_capacity: usize,
    /// Maximum silence on the log channel before the session gives up. 0 disables.
    pub log_idle_timeout_secs: u64,
    /// Emit ANSI colors in progress and log lines.
    pub colored: bool,
    /// Upper bound for the decoded archive and for its uncompressed contents.
    pub max_archive_bytes: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            log_idle_timeout_secs: 30 * 60,
            colored: true,
            max_archive_bytes: 512 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    pub const fn artifact_lifetime(&self) -> Duration {
        Duration::from_secs(self.artifact_lifetime_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl RelayConfig {
    /// `None` when the idle timeout is disabled.
    pub const fn log_idle_timeout(&self) -> Option<Duration> {
        if self.log_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.log_idle_timeout_secs))
        }
    }
}

impl Config {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.queue_name.trim().is_empty() {
            return Err(Error::Config("broker.queue_name must not be empty".into()));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(Error::Config("storage.bucket must not be empty".into()));
        }
        if self.relay.queue_capacity == 0 {
            return Err(Error::Config("relay.queue_capacity must be at least 1".into()));
        }
        if self.storage.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "storage.sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/buildgate/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("buildgate").join("settings.json"))
    }
}

/// Default root of the local artifact store.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .map_or_else(|| PathBuf::from(".buildgate"), |p| p.join("buildgate"))
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = lookup("BUILDGATE_ADDR").and_then(|v| v.parse().ok()) {
        config.server.addr = addr;
    }
    if let Some(val) = lookup("BUILDGATE_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("BUILDGATE_DATA_DIR") {
        config.storage.data_dir = PathBuf::from(val);
    }
    if let Some(val) = lookup("BUILDGATE_BUCKET") {
        config.storage.bucket = val;
    }
    if let Some(val) = lookup("BUILDGATE_UPLOAD_DIR") {
        config.storage.upload_destination_dir = val;
    }
    if let Some(val) = lookup("BUILDGATE_QUEUE_NAME") {
        config.broker.queue_name = val;
    }
    if let Some(val) = lookup("BUILDGATE_ARCHITECTURE") {
        config.broker.architecture = val;
    }
    if let Some(secs) = lookup("BUILDGATE_LOG_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.relay.log_idle_timeout_secs = secs;
    }
}
