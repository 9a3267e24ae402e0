//! Configuration commands.

use crate::config::HubwireConfig;
use crate::error::CliResult;

/// Dump the current configuration to stdout.
pub fn dump(config: &HubwireConfig) -> CliResult<()> {
    println!("# config.toml ({})", HubwireConfig::default_path().display());
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &HubwireConfig) -> CliResult<()> {
    config.to_server_config()?;
    config.broker_listen_addr()?;
    if !config.auth.tokens.is_empty() && !config.auth.allow_anonymous {
        println!(
            "Access tokens required ({} configured).",
            config.auth.tokens.len()
        );
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path() -> CliResult<()> {
    println!("config: {}", HubwireConfig::default_path().display());
    Ok(())
}
