//! Relay command: runs the broker that links server instances.

use tracing::info;

use hubwire_server::{RelayBroker, SignalHandler};

use crate::cli::RelayArgs;
use crate::config::HubwireConfig;
use crate::error::CliResult;

/// Runs the relay broker until a shutdown signal is received.
pub async fn run(args: &RelayArgs, config: &HubwireConfig) -> CliResult<()> {
    let addr = match args.listen {
        Some(addr) => addr,
        None => config.broker_listen_addr()?,
    };
    let max_peers = args.max_peers.unwrap_or(config.relay.max_peers);

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener();

    let broker = RelayBroker::bind(addr, max_peers).await?;
    info!(addr = %broker.local_addr()?, max_peers, "Starting relay broker");
    broker
        .run_until_shutdown(signal_handler.shutdown().wait())
        .await?;

    info!("Relay broker stopped");
    Ok(())
}
