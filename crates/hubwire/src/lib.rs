//! Hub server binary: CLI, configuration, test hub, relay broker.
//!
//! This crate provides the `hubwire` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod test_hub;

pub use cli::Cli;
pub use config::HubwireConfig;
pub use error::{CliError, CliResult};
