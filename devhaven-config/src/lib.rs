//! Configuration system for the DevHaven tmux session engine.
//!
//! This crate provides configuration loading, saving, validation and default
//! values. It includes:
//!
//! - tmux binary discovery (`DEVHAVEN_TMUX_BIN`, `PATH`, well-known locations)
//! - Output buffer, refresh debounce and command timeout limits
//! - Flow control and scrollback settings applied to every workspace session

pub mod config;
pub mod defaults;
pub mod error;
mod types;

pub use config::Config;
pub use error::ConfigError;
pub use types::{ClientSize, LogLevel};
