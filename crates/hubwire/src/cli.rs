//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use hubwire_core::LogFormat;

/// hubwire - real-time hub server
#[derive(Debug, Parser)]
#[command(name = "hubwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, env = "HUBWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, value_parser = parse_log_format, env = "HUBWIRE_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the test hub over WebSocket
    Serve(ServeArgs),

    /// Run a relay broker that links server instances
    Relay(RelayArgs),

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Options for `hubwire serve`. Each one overrides the configuration file.
#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "HUBWIRE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Relay broker to join, `host:port`
    #[arg(long, env = "HUBWIRE_RELAY")]
    pub relay: Option<String>,

    /// Instance identifier announced on the relay
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Send exception detail to clients
    #[arg(long)]
    pub detailed_errors: bool,
}

/// Options for `hubwire relay`.
#[derive(Debug, Default, Args)]
pub struct RelayArgs {
    /// Address to listen on
    #[arg(long, env = "HUBWIRE_RELAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Maximum number of attached server instances
    #[arg(long)]
    pub max_peers: Option<usize>,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(format!(
            "unknown log format '{other}', expected pretty, compact or json"
        )),
    }
}
