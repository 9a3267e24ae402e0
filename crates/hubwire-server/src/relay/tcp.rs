//! Relay client talking to a [`super::RelayBroker`] over TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubwire_core::InstanceId;
use hubwire_protocol::{read_frame, write_frame};

use super::{RelayEnvelope, RelayHealth, RelayTransport, forward_remote};
use crate::error::{RelayError, RelayResult};
use crate::hub::BoxFuture;

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt after `consecutive_failures` failures.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial.as_secs_f64();
        let multiplier = self.multiplier.powi(consecutive_failures as i32 - 1);
        let delay = base * multiplier;
        let max = self.max.as_secs_f64();

        Duration::from_secs_f64(delay.min(max))
    }
}

/// Settings for [`TcpRelay`].
#[derive(Debug, Clone)]
pub struct TcpRelayConfig {
    /// Broker address, `host:port`.
    pub broker_addr: String,
    pub backoff: Backoff,
    /// Envelopes queued for the broker before publishing fails.
    pub outbound_capacity: usize,
}

impl TcpRelayConfig {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            backoff: Backoff::default(),
            outbound_capacity: 1024,
        }
    }

    /// Builder: set reconnect backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Relay transport backed by a TCP connection to a broker.
///
/// The connection is maintained in the background and re-established with
/// exponential backoff. While it is down, [`RelayTransport::publish`] fails
/// fast and health reports [`RelayHealth::Degraded`].
pub struct TcpRelay {
    outbound: mpsc::Sender<RelayEnvelope>,
    inbound: broadcast::Sender<RelayEnvelope>,
    connected: Arc<AtomicBool>,
    health: watch::Receiver<RelayHealth>,
    shutdown: CancellationToken,
}

impl TcpRelay {
    /// Starts connecting to the broker in the background.
    pub fn connect(config: TcpRelayConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound, _) = broadcast::channel(config.outbound_capacity.max(1));
        let (health_tx, health) = watch::channel(RelayHealth::Degraded);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(run(
            config,
            outbound_rx,
            inbound.clone(),
            connected.clone(),
            health_tx,
            shutdown.clone(),
        ));

        Self {
            outbound,
            inbound,
            connected,
            health,
            shutdown,
        }
    }

    /// Stops the background connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RelayTransport for TcpRelay {
    fn publish(&self, envelope: RelayEnvelope) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(RelayError::unavailable("not connected to the relay broker"));
            }
            self.outbound.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RelayError::unavailable("relay outbound queue is full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RelayError::unavailable("relay client stopped")
                }
            })
        })
    }

    fn subscribe(&self, instance: &InstanceId) -> mpsc::Receiver<RelayEnvelope> {
        forward_remote(self.inbound.subscribe(), instance.clone())
    }

    fn health(&self) -> watch::Receiver<RelayHealth> {
        self.health.clone()
    }
}

async fn run(
    config: TcpRelayConfig,
    mut outbound: mpsc::Receiver<RelayEnvelope>,
    inbound: broadcast::Sender<RelayEnvelope>,
    connected: Arc<AtomicBool>,
    health: watch::Sender<RelayHealth>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;

    while !shutdown.is_cancelled() {
        match TcpStream::connect(&config.broker_addr).await {
            Ok(stream) => {
                failures = 0;
                let _ = stream.set_nodelay(true);
                info!(broker = %config.broker_addr, "Connected to relay broker");
                connected.store(true, Ordering::Release);
                health.send_replace(RelayHealth::Connected);

                let reason = pump(stream, &mut outbound, &inbound, &shutdown).await;

                connected.store(false, Ordering::Release);
                health.send_replace(RelayHealth::Degraded);
                if shutdown.is_cancelled() {
                    break;
                }
                warn!(broker = %config.broker_addr, reason = %reason, "Lost relay broker connection");
                // Envelopes queued for the dead link are dropped.
                while outbound.try_recv().is_ok() {}
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                if failures == 1 {
                    warn!(broker = %config.broker_addr, error = %e, "Cannot reach relay broker");
                } else {
                    debug!(broker = %config.broker_addr, error = %e, failures, "Relay broker still unreachable");
                }
            }
        }

        let delay = config.backoff.delay(failures.max(1));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Relay client stopped");
}

/// Moves envelopes in both directions until the link fails.
async fn pump(
    stream: TcpStream,
    outbound: &mut mpsc::Receiver<RelayEnvelope>,
    inbound: &broadcast::Sender<RelayEnvelope>,
    shutdown: &CancellationToken,
) -> String {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::spawn(read_loop(read_half, inbound.clone()));

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "shutdown".to_string(),
            result = &mut reader => {
                break match result {
                    Ok(reason) => reason,
                    Err(e) => e.to_string(),
                };
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    break "publisher dropped".to_string();
                };
                if let Err(e) = write_frame(&mut write_half, &envelope).await {
                    break e.to_string();
                }
            }
        }
    };
    reader.abort();
    reason
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    inbound: broadcast::Sender<RelayEnvelope>,
) -> String {
    loop {
        match read_frame::<_, RelayEnvelope>(&mut read_half).await {
            Ok(Some(envelope)) => {
                let _ = inbound.send(envelope);
            }
            Ok(None) => return "broker closed the connection".to_string(),
            Err(e) => return e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn publish_fails_fast_without_broker() {
        let relay = TcpRelay::connect(TcpRelayConfig::new("127.0.0.1:9"));
        let envelope = RelayEnvelope {
            origin: InstanceId::new("one"),
            hub: "/hub".into(),
            event: crate::relay::RelayEvent::ConnectionClosed {
                connection_id: hubwire_core::ConnectionId::from("c"),
            },
        };
        assert!(matches!(
            relay.publish(envelope).await,
            Err(RelayError::Unavailable { .. })
        ));
        assert_eq!(*relay.health().borrow(), RelayHealth::Degraded);
    }
}
