//! Configuration loading, validation, and CLI/env merging.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
