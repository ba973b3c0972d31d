//! Launch configuration and argument construction
//!
//! Turns the `launch` request arguments into the ordered argument vector
//! handed to the Java launcher.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use super::{LaunchError, LaunchResult};

/// Separator used when joining module and class path entries
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: &str = ";";
/// Separator used when joining module and class path entries
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: &str = ":";

/// Separator between module name and class in a module-qualified main class
pub const MODULE_SEPARATOR: char = '/';

/// Ordered command-line tokens passed to the runtime binary
pub type ArgumentVector = Vec<String>;

/// What to run and how, as supplied by the front end's `launch` request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfiguration {
    /// Main class, optionally module-qualified (`module/Class`)
    pub main_class: String,
    /// Raw JVM options, passed through as one token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_args: Option<String>,
    /// Module path entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_paths: Option<Vec<String>>,
    /// Class path entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_paths: Option<Vec<String>>,
    /// Raw program arguments, passed through as one token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// Working directory for the program
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the program
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub env: HashMap<String, String>,
}

/// Accept `null` wherever an environment map is expected
fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl LaunchConfiguration {
    /// Check the configuration before anything is spawned
    ///
    /// The argument builder itself never fails; this is where a missing or
    /// malformed main class is caught.
    pub fn validate(&self) -> LaunchResult<()> {
        if self.main_class.trim().is_empty() {
            return Err(LaunchError::MissingMainClass);
        }
        if self.main_class.matches(MODULE_SEPARATOR).count() > 1 {
            return Err(LaunchError::MalformedMainClass(self.main_class.clone()));
        }
        Ok(())
    }

    /// Whether the main class must be launched with `-m`
    pub fn is_module_launch(&self) -> bool {
        non_empty(&self.module_paths).is_some()
            || self.main_class.split(MODULE_SEPARATOR).count() == 2
    }
}

/// Build the launcher arguments for a configuration
///
/// Order: vm args, `--module-path`, `-cp`, `-m`, main class, program args.
/// Absent or empty fields contribute nothing.
pub fn build_arguments(config: &LaunchConfiguration) -> ArgumentVector {
    let mut params = Vec::new();

    if let Some(vm_args) = non_blank(&config.vm_args) {
        params.push(vm_args.to_string());
    }

    if let Some(paths) = non_empty(&config.module_paths) {
        params.push("--module-path".to_string());
        params.push(paths.join(PATH_LIST_SEPARATOR));
    }

    if let Some(paths) = non_empty(&config.class_paths) {
        params.push("-cp".to_string());
        params.push(paths.join(PATH_LIST_SEPARATOR));
    }

    if config.is_module_launch() {
        params.push("-m".to_string());
    }
    params.push(config.main_class.clone());

    if let Some(args) = non_blank(&config.args) {
        params.push(args.to_string());
    }

    params
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn non_empty(paths: &Option<Vec<String>>) -> Option<&[String]> {
    paths.as_deref().filter(|p| !p.is_empty())
}
