//! Configuration module
//!
//! Handles loading bridge configuration from disk.

mod bridge;

pub use bridge::*;
