//! Relay-backed delivery across several server instances.
//!
//! Every instance keeps its own connections and group memberships. Each
//! outbound operation is applied locally and then published on the relay as
//! a [`RelayEnvelope`]; the other instances apply it to their own local
//! connections. A broadcast to group "G" issued on instance A therefore
//! reaches members of "G" connected to instance B.
//!
//! Relay failures never block local delivery: the backend logs the outage
//! once, keeps serving local clients, and the transport reports
//! [`RelayHealth::Degraded`] until it recovers.

mod broker;
mod memory;
mod tcp;

pub use broker::RelayBroker;
pub use memory::MemoryRelay;
pub use tcp::{Backoff, TcpRelay, TcpRelayConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubwire_core::{ConnectionId, InstanceId};
use hubwire_protocol::HubMessage;

use crate::connection::Connection;
use crate::delivery::{DeliveryBackend, LocalDelivery, Target};
use crate::error::RelayResult;
use crate::hub::BoxFuture;

/// Envelopes buffered per subscriber.
const SUBSCRIBER_BUFFER: usize = 1024;

/// One operation mirrored between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Instance that published the envelope.
    pub origin: InstanceId,
    /// Hub path the operation belongs to.
    pub hub: String,
    pub event: RelayEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Deliver {
        target: Target,
        message: HubMessage,
    },
    GroupJoin {
        group: String,
        connection_id: ConnectionId,
    },
    GroupLeave {
        group: String,
        connection_id: ConnectionId,
    },
    ConnectionOpened {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
    /// The origin instance dropped off the relay. Published by the broker
    /// for every hub, so `hub` is empty.
    InstanceLeft,
}

/// Reachability of the relay as seen by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayHealth {
    Connected,
    /// The relay is unreachable; only local clients receive messages.
    Degraded,
}

/// A pub/sub channel shared by all instances of a hub fleet.
pub trait RelayTransport: Send + Sync {
    /// Publishes an envelope to every other instance.
    ///
    /// Must not wait for the relay to come back; an unavailable relay is
    /// reported as an error immediately.
    fn publish(&self, envelope: RelayEnvelope) -> BoxFuture<'_, RelayResult<()>>;

    /// Stream of envelopes published by instances other than `instance`.
    fn subscribe(&self, instance: &InstanceId) -> mpsc::Receiver<RelayEnvelope>;

    fn health(&self) -> watch::Receiver<RelayHealth>;
}

/// Forwards a broadcast feed to a subscriber, dropping its own envelopes.
pub(crate) fn forward_remote(
    mut feed: broadcast::Receiver<RelayEnvelope>,
    instance: InstanceId,
) -> mpsc::Receiver<RelayEnvelope> {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(envelope) if envelope.origin == instance => {}
                Ok(envelope) => {
                    if tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(instance = %instance, skipped, "Relay subscriber lagged, envelopes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    rx
}

/// [`DeliveryBackend`] that mirrors every operation through a relay.
pub struct RelayDelivery {
    hub: String,
    instance: InstanceId,
    local: LocalDelivery,
    relay: Arc<dyn RelayTransport>,
    /// Connections announced by other instances.
    remote: RwLock<HashMap<ConnectionId, InstanceId>>,
    degraded: AtomicBool,
}

impl RelayDelivery {
    pub fn new(
        hub: impl Into<String>,
        instance: InstanceId,
        local: LocalDelivery,
        relay: Arc<dyn RelayTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub: hub.into(),
            instance,
            local,
            relay,
            remote: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        })
    }

    /// Starts applying envelopes from other instances until `shutdown` fires.
    ///
    /// Remote connections are forgotten when this instance loses the relay,
    /// since their closures can no longer be observed.
    pub fn spawn_subscriber(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut inbound = self.relay.subscribe(&self.instance);
        let mut health = self.relay.health();
        let this = self.clone();
        tokio::spawn(async move {
            let mut watching_health = true;
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = health.changed(), if watching_health => {
                        if changed.is_err() {
                            watching_health = false;
                        } else if *health.borrow_and_update() == RelayHealth::Degraded {
                            this.forget_remote(None).await;
                        }
                        continue;
                    }
                    envelope = inbound.recv() => envelope,
                };
                let Some(envelope) = envelope else { break };
                if envelope.hub == this.hub || matches!(envelope.event, RelayEvent::InstanceLeft) {
                    this.apply(envelope).await;
                }
            }
            debug!(hub = %this.hub, "Relay subscriber stopped");
        })
    }

    /// Drops remote connections owned by `origin`, or all of them.
    async fn forget_remote(&self, origin: Option<&InstanceId>) {
        let mut remote = self.remote.write().await;
        let before = remote.len();
        match origin {
            Some(origin) => remote.retain(|_, owner| owner != origin),
            None => remote.clear(),
        }
        let dropped = before - remote.len();
        if dropped > 0 {
            info!(
                hub = %self.hub,
                origin = origin.map(InstanceId::as_str).unwrap_or("*"),
                dropped,
                "Forgot remote connections"
            );
        }
    }

    /// Whether the last publish failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Connections other instances have announced and not yet closed.
    pub async fn remote_connection_count(&self) -> usize {
        self.remote.read().await.len()
    }

    async fn publish(&self, event: RelayEvent) {
        let envelope = RelayEnvelope {
            origin: self.instance.clone(),
            hub: self.hub.clone(),
            event,
        };
        match self.relay.publish(envelope).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(hub = %self.hub, "Relay available again, cross-instance delivery resumed");
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(
                        hub = %self.hub,
                        error = %e,
                        "Relay unavailable, delivering to local connections only"
                    );
                } else {
                    debug!(hub = %self.hub, error = %e, "Relay publish failed");
                }
            }
        }
    }

    async fn apply(&self, envelope: RelayEnvelope) {
        let origin = envelope.origin;
        match envelope.event {
            RelayEvent::Deliver { target, message } => {
                let delivered = self.local.deliver_local(&target, &message).await;
                debug!(hub = %self.hub, origin = %origin, delivered, "Applied relayed delivery");
            }
            RelayEvent::GroupJoin {
                group,
                connection_id,
            } => {
                self.local.join_group(&connection_id, &group).await;
            }
            RelayEvent::GroupLeave {
                group,
                connection_id,
            } => {
                self.local.leave_group(&connection_id, &group).await;
            }
            RelayEvent::ConnectionOpened { connection_id } => {
                self.remote.write().await.insert(connection_id, origin);
            }
            RelayEvent::ConnectionClosed { connection_id } => {
                self.remote.write().await.remove(&connection_id);
            }
            RelayEvent::InstanceLeft => self.forget_remote(Some(&origin)).await,
        }
    }
}

impl DeliveryBackend for RelayDelivery {
    fn on_connected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.local.register(connection).await;
            self.publish(RelayEvent::ConnectionOpened {
                connection_id: connection.id().clone(),
            })
            .await;
        })
    }

    fn on_disconnected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.local.unregister(connection.id()).await;
            self.publish(RelayEvent::ConnectionClosed {
                connection_id: connection.id().clone(),
            })
            .await;
        })
    }

    fn deliver<'a>(&'a self, target: &'a Target, message: &'a HubMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Target::Connection { connection_id } = target
                && self.local.contains(connection_id).await
            {
                self.local.deliver_local(target, message).await;
                return;
            }
            self.local.deliver_local(target, message).await;
            self.publish(RelayEvent::Deliver {
                target: target.clone(),
                message: message.clone(),
            })
            .await;
        })
    }

    fn add_to_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.local.join_group(connection_id, group).await {
                self.publish(RelayEvent::GroupJoin {
                    group: group.to_string(),
                    connection_id: connection_id.clone(),
                })
                .await;
            }
        })
    }

    fn remove_from_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.local.leave_group(connection_id, group).await {
                self.publish(RelayEvent::GroupLeave {
                    group: group.to_string(),
                    connection_id: connection_id.clone(),
                })
                .await;
            }
        })
    }

    fn local(&self) -> &LocalDelivery {
        &self.local
    }
}
