//! Configuration management for dut-provision.
//!
//! This module handles loading and saving the device connection settings,
//! the caching proxy address and the provisioning timeouts.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/dut-provision/config.yml`
//! - macOS: `~/Library/Application Support/dut-provision/config.yml`
//! - Windows: `C:\Users\<User>\AppData\Roaming\dut-provision\config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! dut:
//!   name: "chromeos6-row2-rack3-host4"
//!   user: "root"
//!   port: 22
//!   ssh_key: "~/.ssh/testing_rsa"
//! hosts:
//!   chromeos6-row2-rack3-host4: "100.115.168.9:22"
//! cache_address: "http://100.115.168.1:8082"
//! serializer_path: "/usr/local/sbin/crash_serializer"
//! firmware_reboot_timeout_secs: 300
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crash::{DEFAULT_CHUNK_SIZE, DEFAULT_SERIALIZER_PATH};
use crate::error::{Error, Result};
use crate::remote::retry::RetryConfig;

/// Default SSH port
const DEFAULT_SSH_PORT: u16 = 22;

/// Default login on test images
const DEFAULT_SSH_USER: &str = "root";

/// Default SSH connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 60;

const DEFAULT_REBOOT_TIMEOUT: u64 = 120;

/// Post firmware update reboots are slower than OS reboots.
const DEFAULT_FIRMWARE_REBOOT_TIMEOUT: u64 = 300;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device under test
    pub dut: DutConfig,

    /// Name to `host:port` lookup table, consulted before dialing
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    /// Base URL of the caching proxy the device downloads artifacts from
    #[serde(default)]
    pub cache_address: String,

    /// Path of the crash_serializer helper on the device
    #[serde(default = "default_serializer_path")]
    pub serializer_path: String,

    #[serde(default = "default_proto_chunk_size")]
    pub proto_chunk_size: u64,

    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_secs: u64,

    #[serde(default = "default_firmware_reboot_timeout")]
    pub firmware_reboot_timeout_secs: u64,

    /// Backoff applied when dialing the device
    #[serde(default)]
    pub dial_retry: RetryConfig,
}

/// Connection settings for the device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutConfig {
    /// Device name or `host[:port]` address
    pub name: String,

    /// SSH username for authentication
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// SSH port used when the resolved address carries none
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Path to SSH private key file (optional, falls back to the agent)
    pub ssh_key: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub timeout: u64,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_serializer_path() -> String {
    DEFAULT_SERIALIZER_PATH.to_string()
}

fn default_proto_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_reboot_timeout() -> u64 {
    DEFAULT_REBOOT_TIMEOUT
}

fn default_firmware_reboot_timeout() -> u64 {
    DEFAULT_FIRMWARE_REBOOT_TIMEOUT
}

impl Config {
    /// Creates a configuration for the named device with every other field
    /// at its default.
    pub fn new(dut: DutConfig) -> Self {
        Self {
            dut,
            hosts: HashMap::new(),
            cache_address: String::new(),
            serializer_path: default_serializer_path(),
            proto_chunk_size: DEFAULT_CHUNK_SIZE,
            reboot_timeout_secs: DEFAULT_REBOOT_TIMEOUT,
            firmware_reboot_timeout_secs: DEFAULT_FIRMWARE_REBOOT_TIMEOUT,
            dial_retry: RetryConfig::default(),
        }
    }

    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dut-provision").join("config.yml"))
    }

    /// Loads configuration from the default location.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Err(Error::Config(
                "could not determine config directory, pass --config explicitly".to_string(),
            )),
        }
    }

    /// Loads configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {}\n\n\
                 Suggestions:\n\
                 • Check file permissions: ls -la {}\n\
                 • Create one with at least a `dut.name` entry",
                path.display(),
                e,
                path.display()
            ))
        })?;

        Self::from_yaml(&contents)
            .map_err(|e| e.context(format!("config file {}", path.display())))
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).map_err(|e| {
            Error::Config(format!(
                "failed to parse config: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs",
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a specific file path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.dut.name.trim().is_empty() {
            return Err(Error::Config("dut.name must not be empty".to_string()));
        }
        if self.firmware_reboot_timeout_secs == 0 || self.reboot_timeout_secs == 0 {
            return Err(Error::Config(
                "reboot timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }

    pub fn firmware_reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.firmware_reboot_timeout_secs)
    }

    /// Builder method to set the caching proxy address.
    pub fn with_cache_address(mut self, address: String) -> Self {
        self.cache_address = address;
        self
    }

    /// Builder method to set the firmware reboot timeout.
    pub fn with_firmware_reboot_timeout(mut self, secs: u64) -> Self {
        self.firmware_reboot_timeout_secs = secs;
        self
    }

    /// Builder method to register a name to address mapping.
    pub fn with_host(mut self, name: String, address: String) -> Self {
        self.hosts.insert(name, address);
        self
    }
}

impl DutConfig {
    /// Creates a new device configuration with required fields.
    pub fn new(name: String) -> Self {
        Self {
            name,
            user: DEFAULT_SSH_USER.to_string(),
            port: DEFAULT_SSH_PORT,
            ssh_key: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builder method to set the SSH user.
    pub fn with_user(mut self, user: String) -> Self {
        self.user = user;
        self
    }

    /// Builder method to set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder method to set the SSH key path.
    pub fn with_ssh_key(mut self, key_path: String) -> Self {
        self.ssh_key = Some(key_path);
        self
    }

    /// Builder method to set the timeout.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expands the SSH key path, replacing ~ with the home directory.
    pub fn expanded_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_key.as_ref().map(|key| {
            if let Some(stripped) = key.strip_prefix("~/") {
                if let Some(home) = dirs::home_dir() {
                    return home.join(stripped);
                }
            }
            PathBuf::from(key)
        })
    }
}
