//! Process management module
//!
//! Runs the Java launcher as a child process with piped output.

mod child;

pub use child::*;
