//! Runtime binary resolution
//!
//! Locates `<home>/bin/java` from an explicit override or the installation
//! root named by an environment variable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{LaunchError, LaunchResult};

/// Environment variable holding the runtime installation root
pub const DEFAULT_HOME_VAR: &str = "JAVA_HOME";

/// Launcher binary name inside `<home>/bin`
pub const DEFAULT_BINARY: &str = "java";

/// Finds the runtime binary to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocator {
    /// Installation root that takes precedence over the environment
    pub home_override: Option<PathBuf>,
    /// Environment variable consulted when no override is set
    pub home_var: String,
    /// Binary name, without platform suffix
    pub binary: String,
}

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self {
            home_override: None,
            home_var: DEFAULT_HOME_VAR.to_string(),
            binary: DEFAULT_BINARY.to_string(),
        }
    }
}

impl RuntimeLocator {
    /// Create a locator that reads the default environment variable
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the installation root instead of reading the environment
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home_override = home;
        self
    }

    /// Read the installation root from a different environment variable
    pub fn with_home_var(mut self, var: impl Into<String>) -> Self {
        self.home_var = var.into();
        self
    }

    /// Use a different launcher binary name
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Resolve the runtime installation root
    pub fn home(&self) -> LaunchResult<PathBuf> {
        if let Some(home) = &self.home_override {
            return Ok(home.clone());
        }

        std::env::var_os(&self.home_var)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| LaunchError::RuntimeHomeUnset(self.home_var.clone()))
    }

    /// Resolve the full path of the runtime binary
    ///
    /// The binary is not checked for existence; a missing file surfaces as a
    /// spawn failure.
    pub fn resolve(&self) -> LaunchResult<PathBuf> {
        let home = self.home()?;
        Ok(binary_path(&home, &self.binary))
    }
}

/// `<home>/bin/<binary><EXE_SUFFIX>`
pub fn binary_path(home: &Path, binary: &str) -> PathBuf {
    let mut name = OsString::from(binary);
    name.push(std::env::consts::EXE_SUFFIX);
    home.join("bin").join(name)
}
