//! hubwire CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use hubwire::cli::{Cli, Command, ConfigAction};
use hubwire::commands;
use hubwire::config::HubwireConfig;
use hubwire::error::CliResult;
use hubwire_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    // Load configuration
    let config = match cli.config {
        Some(ref path) => HubwireConfig::load_from(path)?,
        None => HubwireConfig::load()?,
    };

    // Initialize tracing
    let mut tracing_config = if cli.debug || config.debug {
        TracingConfig::debug()
    } else {
        TracingConfig::default()
    };
    tracing_config = tracing_config.with_format(cli.log_format.unwrap_or(config.log.format));
    if let Some(ref directive) = config.log.directive {
        tracing_config = tracing_config.with_directive(directive);
    }
    init_tracing(tracing_config)?;

    match cli.command {
        Command::Serve(ref args) => commands::serve::run(args, &config).await,
        Command::Relay(ref args) => commands::relay::run(args, &config).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
