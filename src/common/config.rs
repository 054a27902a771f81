//! Persisted relay configuration (companion address, display delay).
//!
//! The record lives in a small TOML file. The relay core only ever reads it,
//! once per relay decision; `config set` is the single writer.

use crate::common::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Seconds a relayed notification stays visible when nothing is configured.
pub const DEFAULT_DISPLAY_SECONDS: u64 = 3;

/// Messenger whose notifications are relayed unless configured otherwise.
pub const DEFAULT_SOURCE_APP: &str = "com.tencent.mm";

/// Environment override for the config file location (used by tests and
/// by users running several relays side by side).
pub const CONFIG_PATH_ENV: &str = "COMPANION_RELAY_CONFIG";

fn default_delay() -> u64 {
    DEFAULT_DISPLAY_SECONDS
}

fn default_source() -> String {
    DEFAULT_SOURCE_APP.to_string()
}

/// Configuration record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Companion hardware address, uppercase. Empty disables relaying.
    #[serde(default)]
    pub mac: String,
    /// How long a relayed notification stays up, in seconds.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Application id whose notifications are candidates for relay.
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mac: String::new(),
            delay: DEFAULT_DISPLAY_SECONDS,
            source: default_source(),
        }
    }
}

impl RelayConfig {
    /// Build a record with a normalized companion address.
    pub fn new(mac: &str, delay: u64) -> Self {
        Self {
            mac: normalize_address(mac),
            delay,
            ..Self::default()
        }
    }

    /// Relaying is only armed once a companion address is configured.
    pub fn is_enabled(&self) -> bool {
        !self.mac.is_empty()
    }

    pub fn display_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delay)
    }

    fn normalized(mut self) -> Self {
        self.mac = normalize_address(&self.mac);
        self.source = self.source.trim().to_string();
        if self.source.is_empty() {
            self.source = default_source();
        }
        self
    }
}

/// Trim and uppercase a hardware address.
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Parse a delay as typed by a user; blank input falls back to the default.
pub fn parse_delay(raw: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_DISPLAY_SECONDS);
    }
    trimmed.parse()
}

/// Syntactic check for a `AA:BB:CC:DD:EE:FF` style address.
pub fn is_valid_address(address: &str) -> bool {
    let parts: Vec<&str> = address.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Read access to the configuration record, re-evaluated on every call.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<RelayConfig>;
}

/// File-backed configuration store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default location (or `COMPANION_RELAY_CONFIG`).
    pub fn open_default() -> Self {
        Self::new(get_config_file_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. A missing file is the unconfigured state, not an error.
    pub fn load(&self) -> Result<RelayConfig> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RelayConfig::default())
            }
            Err(source) => {
                return Err(RelayError::ConfigRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        toml::from_str::<RelayConfig>(&content)
            .map(RelayConfig::normalized)
            .map_err(|err| RelayError::ConfigParse {
                path: self.path.clone(),
                details: err.to_string(),
            })
    }

    /// Persist the record atomically (write to a temp file, then rename).
    pub fn save(&self, config: &RelayConfig) -> Result<()> {
        let write_err = |details: String| RelayError::ConfigWrite {
            path: self.path.clone(),
            details,
        };

        let normalized = config.clone().normalized();
        let content = toml::to_string_pretty(&normalized).map_err(|e| write_err(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(|e| write_err(e.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| write_err(e.to_string()))?;
        Ok(())
    }
}

impl ConfigSource for ConfigStore {
    fn load(&self) -> Result<RelayConfig> {
        ConfigStore::load(self)
    }
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("companion-relay")
        .join("config.toml")
}
