//! Subcommand implementations.

pub mod config;
pub mod relay;
pub mod serve;
