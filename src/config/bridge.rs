//! Bridge configuration
//!
//! Loads bridge settings from .jrun/config.toml

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::launch::{RuntimeLocator, DEFAULT_BINARY, DEFAULT_HOME_VAR};
use crate::session::{SessionConfig, DEFAULT_LINGER};

/// Configuration file location, relative to the working directory
pub const CONFIG_DIR: &str = ".jrun";
pub const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid bind address '{0}'")]
    InvalidBind(String),
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the session listener binds to
    pub bind: String,
    /// Runtime installation root; overrides the environment variable
    pub runtime_home: Option<PathBuf>,
    /// Environment variable naming the installation root
    pub runtime_home_var: String,
    /// Launcher binary inside `<home>/bin`
    pub runtime_binary: String,
    /// Seconds to wait for a process after requesting termination
    pub linger_secs: u64,
    /// Extra environment for launched processes
    pub env: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            runtime_home: None,
            runtime_home_var: DEFAULT_HOME_VAR.to_string(),
            runtime_binary: DEFAULT_BINARY.to_string(),
            linger_secs: DEFAULT_LINGER.as_secs(),
            env: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Default config path under a directory
    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from a file; a missing file yields defaults
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Build the session configuration
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let bind: IpAddr = self
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))?;

        let locator = RuntimeLocator::new()
            .with_home(self.runtime_home.clone())
            .with_home_var(self.runtime_home_var.clone())
            .with_binary(self.runtime_binary.clone());

        Ok(SessionConfig::new()
            .with_bind(bind)
            .with_locator(locator)
            .with_env(self.env.clone())
            .with_linger(Duration::from_secs(self.linger_secs)))
    }
}
