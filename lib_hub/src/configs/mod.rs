//! # Configuration Module
//!
//! Layered configuration for the hub server: built-in defaults, an optional
//! JSON file, then environment variables and command-line flags.
//!
//! - **`config_hub`**: the `clap`/`serde` layer type [`ServerConfig`], its
//!   merge and validation into [`Settings`], and [`load_config`].

/// Layered server configuration.
pub mod config_hub;

pub use config_hub::{default_config_path, load_config, ConfigError, ServerConfig, Settings, TlsPaths};
