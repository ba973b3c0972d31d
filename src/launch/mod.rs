//! Launch module
//!
//! Everything needed to turn a launch configuration into a process
//! invocation: argument construction and runtime binary resolution.

mod args;
mod runtime;

pub use args::*;
pub use runtime::*;

use thiserror::Error;

/// Errors that stop a launch before the process is spawned
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("mainClass is missing or empty")]
    MissingMainClass,

    #[error("mainClass '{0}' has more than one '/' separator")]
    MalformedMainClass(String),

    #[error("runtime installation root is not set ({0} is empty or undefined)")]
    RuntimeHomeUnset(String),
}

/// Result type for launch preparation
pub type LaunchResult<T> = Result<T, LaunchError>;
