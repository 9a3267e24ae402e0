//! Serve command: runs the test hub in the foreground.
//!
//! Components, in start order:
//! - Dispatcher built from the configuration file and CLI overrides
//! - Optional relay client linking this instance to a broker
//! - Signal handler (SIGTERM/SIGINT)
//! - WebSocket listener

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hubwire_core::InstanceId;
use hubwire_server::{
    Dispatcher, RelayHealth, ServerConfig, SignalHandler, TcpRelay, TcpRelayConfig, serve,
};

use crate::cli::ServeArgs;
use crate::config::HubwireConfig;
use crate::error::{CliError, CliResult};
use crate::test_hub;

/// Starts the hub server and blocks until a shutdown signal is received.
pub async fn run(args: &ServeArgs, config: &HubwireConfig) -> CliResult<()> {
    let server_config = server_config(args, config)?;
    let relay = relay_client(args, config);
    let dispatcher = build_dispatcher(args, config, server_config.clone(), relay.clone())?;

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener();

    let health_task = dispatcher
        .relay_health()
        .map(|health| spawn_health_logger(health, signal_handler.shutdown()));

    let listener = TcpListener::bind(server_config.listen_addr)
        .await
        .map_err(|e| {
            CliError::config(format!(
                "failed to bind {}: {}",
                server_config.listen_addr, e
            ))
        })?;

    info!(
        instance = %dispatcher.instance_id(),
        relay = config_broker(args, config).unwrap_or("none"),
        "Starting hub server"
    );
    serve(listener, Arc::new(dispatcher), signal_handler.shutdown().wait()).await?;

    if let Some(relay) = relay {
        relay.shutdown();
    }
    if let Some(task) = health_task {
        task.abort();
    }
    info!("Server stopped");
    Ok(())
}

/// Server configuration with CLI overrides applied.
pub fn server_config(args: &ServeArgs, config: &HubwireConfig) -> CliResult<ServerConfig> {
    let mut server_config = config.to_server_config()?;
    if let Some(listen) = args.listen {
        server_config.listen_addr = listen;
    }
    if let Some(max) = args.max_connections {
        server_config = server_config.with_max_connections(max);
    }
    if args.detailed_errors {
        server_config = server_config.with_detailed_errors(true);
    }
    server_config.validate()?;
    Ok(server_config)
}

/// Builds the dispatcher with the test hub registered.
///
/// The relay must be attached before hubs are registered so that their
/// delivery goes through it.
pub fn build_dispatcher(
    args: &ServeArgs,
    config: &HubwireConfig,
    server_config: ServerConfig,
    relay: Option<Arc<TcpRelay>>,
) -> CliResult<Dispatcher> {
    let mut dispatcher = Dispatcher::new(server_config);

    let instance_id = args
        .instance_id
        .as_deref()
        .or(config.relay.instance_id.as_deref());
    if let Some(id) = instance_id {
        dispatcher = dispatcher.with_instance_id(InstanceId::new(id));
    }
    if let Some(authenticator) = config.authenticator() {
        info!(tokens = config.auth.tokens.len(), "Access tokens enabled");
        dispatcher = dispatcher.with_authenticator(authenticator);
    }
    if let Some(relay) = relay {
        dispatcher = dispatcher.with_relay(relay);
    }

    dispatcher.register_hub(test_hub::TEST_HUB_PATH, test_hub::methods())?;
    Ok(dispatcher)
}

fn config_broker<'a>(args: &'a ServeArgs, config: &'a HubwireConfig) -> Option<&'a str> {
    args.relay.as_deref().or(config.relay.broker.as_deref())
}

fn relay_client(args: &ServeArgs, config: &HubwireConfig) -> Option<Arc<TcpRelay>> {
    let broker = config_broker(args, config)?;
    info!(broker, "Connecting to relay broker");
    Some(Arc::new(TcpRelay::connect(TcpRelayConfig::new(broker))))
}

fn spawn_health_logger(
    mut health: tokio::sync::watch::Receiver<RelayHealth>,
    shutdown: hubwire_server::ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let watch = async {
            while health.changed().await.is_ok() {
                let state = *health.borrow_and_update();
                match state {
                    RelayHealth::Connected => info!("Relay connected"),
                    RelayHealth::Degraded => {
                        warn!("Relay unavailable, delivering to local connections only")
                    }
                }
            }
        };
        tokio::select! {
            _ = watch => {}
            _ = shutdown.wait() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cli_overrides_file_settings() {
        let mut config = HubwireConfig::default();
        config.server.max_connections = 10;

        let args = ServeArgs {
            listen: Some("0.0.0.0:9000".parse().unwrap()),
            max_connections: Some(3),
            detailed_errors: true,
            ..Default::default()
        };
        let server_config = server_config(&args, &config).unwrap();
        assert_eq!(server_config.listen_addr.port(), 9000);
        assert_eq!(server_config.max_connections, 3);
        assert!(server_config.detailed_errors);
        assert_eq!(server_config.keep_alive_interval, Duration::from_secs(15));
    }

    #[test]
    fn zero_connections_is_rejected() {
        let args = ServeArgs {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(server_config(&args, &HubwireConfig::default()).is_err());
    }

    #[tokio::test]
    async fn dispatcher_hosts_test_hub() {
        let mut config = HubwireConfig::default();
        config.relay.instance_id = Some("from-file".into());
        let args = ServeArgs {
            instance_id: Some("from-cli".into()),
            ..Default::default()
        };

        let dispatcher =
            build_dispatcher(&args, &config, ServerConfig::default(), None).unwrap();
        assert_eq!(dispatcher.hub_paths(), vec![test_hub::TEST_HUB_PATH]);
        assert_eq!(dispatcher.instance_id().as_str(), "from-cli");
        assert!(dispatcher.relay_health().is_none());
    }

    #[tokio::test]
    async fn relay_broker_comes_from_cli_or_file() {
        let mut config = HubwireConfig::default();
        assert!(config_broker(&ServeArgs::default(), &config).is_none());

        config.relay.broker = Some("file:5100".into());
        assert_eq!(
            config_broker(&ServeArgs::default(), &config),
            Some("file:5100")
        );

        let args = ServeArgs {
            relay: Some("cli:5100".into()),
            ..Default::default()
        };
        assert_eq!(config_broker(&args, &config), Some("cli:5100"));
    }
}
