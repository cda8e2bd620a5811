//! Configuration module for sshdeck.
//!
//! Handles loading and parsing the .sshdeckrc configuration file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::logging::LogConfig;
use crate::remote::{DEFAULT_REMOTE_PATH, default_download_dir};
use crate::transport::ssh::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::vault::KdfParams;
use crate::vault::store;

/// Default probe time limit in seconds.
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Upper bound for any configured timeout in seconds.
const MAX_TIMEOUT_SECS: u64 = 600;

/// Default .sshdeckrc file content with all settings documented.
const DEFAULT_SSHDECKRC: &str = r#"# sshdeck Configuration File
# ===========================
# This file is read on startup.
# Lines starting with '#' are comments.
#
# Vault
# -----
# Location of the encrypted credential vault.
# vault_path = ~/.sshdeck/vault.json
#
# Argon2id cost for new vaults and after a master password change.
# Existing secrets keep the parameters recorded in the vault.
# kdf_memory_kib = 19456
# kdf_iterations = 2
# kdf_parallelism = 1

# Connections
# -----------
# connect_timeout_secs = 10   # TCP connect timeout
# probe_timeout_secs = 10     # Time limit per diagnostic probe

# File Transfer
# -------------
# default_remote_path = /     # Directory listed when a channel opens
# download_dir = ~/Downloads  # Where downloads land by default

# Logging Configuration
# ---------------------
# Logs are stored in ~/.sshdeck/logs/ with automatic cleanup.
#
# log_enabled = true       # Enable/disable file logging (true/false)
# log_level = info         # Log level: trace, debug, info, warn, error, off
# log_retention = 24       # Hours to keep log files (default: 24)
"#;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to config file.
    pub config_path: PathBuf,
    /// Vault document location.
    pub vault_path: PathBuf,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-probe time limit in seconds.
    pub probe_timeout_secs: u64,
    /// Directory listed when a filesystem channel opens.
    pub default_remote_path: String,
    /// Default download target.
    pub download_dir: PathBuf,
    /// Key derivation cost for new secrets.
    pub kdf: KdfParams,
    /// Logging configuration.
    pub log_config: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            vault_path: store::default_path(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            default_remote_path: DEFAULT_REMOTE_PATH.to_string(),
            download_dir: default_download_dir(),
            kdf: KdfParams::default(),
            log_config: LogConfig::default(),
        }
    }
}

impl Config {
    /// Returns the default config file path (~/.sshdeckrc).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sshdeckrc")
    }

    /// Loads configuration from the default path, creating it if it doesn't exist.
    ///
    /// # Errors
    /// Returns error if config cannot be read or created.
    pub fn load() -> io::Result<Self> {
        let path = Self::default_config_path();
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    ///
    /// # Errors
    /// Returns error if config cannot be read or created.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        // Create default config if it doesn't exist
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self {
            config_path: path.to_path_buf(),
            ..Self::default()
        };
        config.parse(&content);

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from a string, starting from defaults.
    #[must_use]
    pub fn from_str_content(content: &str) -> Self {
        let mut config = Self::default();
        config.parse(content);
        config
    }

    /// Creates the default config file.
    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_SSHDECKRC.as_bytes())?;
        Ok(())
    }

    /// Parses the config file content.
    fn parse(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Parse key = value
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                // Remove inline comments
                let value = value.split('#').next().unwrap_or(value).trim();

                self.apply_setting(key, value);
            }
        }
    }

    /// Applies a single setting. Unknown keys and malformed values are
    /// ignored.
    fn apply_setting(&mut self, key: &str, value: &str) {
        match key {
            "vault_path" => {
                if !value.is_empty() {
                    self.vault_path = expand_home(value);
                }
            }
            "connect_timeout_secs" => {
                if let Some(secs) = parse_timeout(value) {
                    self.connect_timeout_secs = secs;
                }
            }
            "probe_timeout_secs" => {
                if let Some(secs) = parse_timeout(value) {
                    self.probe_timeout_secs = secs;
                }
            }
            "default_remote_path" => {
                if value.starts_with('/') {
                    self.default_remote_path = value.to_string();
                }
            }
            "download_dir" => {
                if !value.is_empty() {
                    self.download_dir = expand_home(value);
                }
            }
            "kdf_memory_kib" => {
                if let Ok(kib) = value.parse::<u32>() {
                    if kib >= self.kdf.parallelism.saturating_mul(8) {
                        self.kdf.memory_kib = kib;
                    }
                }
            }
            "kdf_iterations" => {
                if let Ok(n) = value.parse::<u32>() {
                    if n > 0 {
                        self.kdf.iterations = n;
                    }
                }
            }
            "kdf_parallelism" => {
                if let Ok(n) = value.parse::<u32>() {
                    if n > 0 && self.kdf.memory_kib >= n.saturating_mul(8) {
                        self.kdf.parallelism = n;
                    }
                }
            }
            "log_level" => {
                self.log_config.level = LogConfig::parse_level(value);
            }
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = LogConfig::parse_retention(value);
            }
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => {
                debug!("Ignoring unknown config key: {}", key);
            }
        }
    }

    /// TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-probe time limit.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Reloads the configuration from disk.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn reload(&mut self) -> io::Result<()> {
        let path = self.config_path.clone();
        *self = Self::load_from(&path)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

fn parse_timeout(value: &str) -> Option<u64> {
    value
        .parse::<u64>()
        .ok()
        .filter(|secs| (1..=MAX_TIMEOUT_SECS).contains(secs))
}

/// Expands a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(value),
    }
}
