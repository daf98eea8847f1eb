//! # Configuration
//!
//! Server configuration: defaults, YAML/JSON files, and environment overrides.

pub mod server;
