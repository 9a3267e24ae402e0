//! Outbound delivery strategies.
//!
//! The dispatcher never touches connections of other clients directly: it
//! hands a [`Target`] and a message to the hub's [`DeliveryBackend`].
//! [`LocalDelivery`] fans out to connections of this process;
//! [`crate::relay::RelayDelivery`] additionally mirrors every operation
//! through a relay so several instances behave as one hub.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use hubwire_core::ConnectionId;
use hubwire_protocol::HubMessage;

use crate::connection::{CloseReason, Connection};
use crate::groups::GroupRegistry;
use crate::hub::BoxFuture;

/// Which connections a message is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    All {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluded: Vec<ConnectionId>,
    },
    Connection {
        connection_id: ConnectionId,
    },
    Group {
        group: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluded: Vec<ConnectionId>,
    },
    User {
        user: String,
    },
}

/// Delivery strategy of one hub, local-only or relay-backed.
pub trait DeliveryBackend: Send + Sync {
    /// Registers a connection that completed its handshake.
    fn on_connected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()>;

    /// Forgets a connection and removes it from all groups.
    fn on_disconnected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()>;

    /// Sends `message` to every connection selected by `target`.
    fn deliver<'a>(&'a self, target: &'a Target, message: &'a HubMessage) -> BoxFuture<'a, ()>;

    fn add_to_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()>;

    fn remove_from_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Connections and groups owned by this process.
    fn local(&self) -> &LocalDelivery;
}

/// In-process delivery: a connection map plus the hub's group registry.
#[derive(Debug)]
pub struct LocalDelivery {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    groups: GroupRegistry,
}

impl Default for LocalDelivery {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LocalDelivery {
    pub fn new(reap_empty_groups: bool) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            groups: GroupRegistry::new(reap_empty_groups),
        }
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub async fn connection(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub(crate) async fn register(&self, connection: &Connection) {
        self.connections
            .write()
            .await
            .insert(connection.id().clone(), connection.clone());
    }

    /// Removes a connection and its group memberships.
    pub(crate) async fn unregister(&self, connection_id: &ConnectionId) {
        self.connections.write().await.remove(connection_id);
        let groups = self.groups.remove_connection(connection_id).await;
        if !groups.is_empty() {
            debug!(connection_id = %connection_id, groups = ?groups, "Removed from groups");
        }
    }

    /// Joins a local connection to a group. Returns `false` if the connection
    /// is not owned by this process.
    ///
    /// The connection map stays read-locked until the membership is recorded,
    /// so a concurrent [`LocalDelivery::unregister`] either runs first and the
    /// join is refused, or runs after and removes the new membership.
    pub async fn join_group(&self, connection_id: &ConnectionId, group: &str) -> bool {
        let connections = self.connections.read().await;
        if !connections.contains_key(connection_id) {
            return false;
        }
        self.groups.join(group, connection_id).await;
        true
    }

    /// Returns `false` if the connection is not owned by this process.
    pub async fn leave_group(&self, connection_id: &ConnectionId, group: &str) -> bool {
        if !self.contains(connection_id).await {
            return false;
        }
        self.groups.leave(group, connection_id).await;
        true
    }

    async fn recipients(&self, target: &Target) -> Vec<Connection> {
        match target {
            Target::All { excluded } => self
                .connections
                .read()
                .await
                .values()
                .filter(|c| !excluded.contains(c.id()))
                .cloned()
                .collect(),
            Target::Connection { connection_id } => {
                self.connection(connection_id).await.into_iter().collect()
            }
            Target::Group { group, excluded } => {
                let members = self.groups.members(group).await;
                let connections = self.connections.read().await;
                members
                    .iter()
                    .filter(|id| !excluded.contains(id))
                    .filter_map(|id| connections.get(id).cloned())
                    .collect()
            }
            Target::User { user } => self
                .connections
                .read()
                .await
                .values()
                .filter(|c| c.identity().as_str() == user)
                .cloned()
                .collect(),
        }
    }

    /// Sends to the local connections selected by `target`.
    ///
    /// Returns how many connections the message was queued for.
    pub async fn deliver_local(&self, target: &Target, message: &HubMessage) -> usize {
        let recipients = self.recipients(target).await;
        let mut delivered = 0;
        for connection in &recipients {
            match connection.send(message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "Failed to encode message for delivery"
                ),
            }
        }
        delivered
    }

    /// Snapshot of every local connection.
    pub async fn connections(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Closes every local connection.
    pub async fn close_all(&self, reason: CloseReason) {
        for connection in self.connections().await {
            connection.close(reason.clone());
        }
    }
}

impl DeliveryBackend for LocalDelivery {
    fn on_connected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(self.register(connection))
    }

    fn on_disconnected<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(self.unregister(connection.id()))
    }

    fn deliver<'a>(&'a self, target: &'a Target, message: &'a HubMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.deliver_local(target, message).await;
        })
    }

    fn add_to_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.join_group(connection_id, group).await {
                debug!(connection_id = %connection_id, group, "Join for unknown connection ignored");
            }
        })
    }

    fn remove_from_group<'a>(
        &'a self,
        connection_id: &'a ConnectionId,
        group: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.leave_group(connection_id, group).await;
        })
    }

    fn local(&self) -> &LocalDelivery {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use hubwire_protocol::HubProtocol;
    use serde_json::json;

    fn received(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<HubMessage> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| HubProtocol::Json.decode(&frame).unwrap().unwrap().0)
            .collect()
    }

    #[tokio::test]
    async fn targets_select_the_right_connections() {
        let local = LocalDelivery::default();
        let (a, mut rx_a) = test_connection("a", 16);
        let (b, mut rx_b) = test_connection("b", 16);
        let (c, mut rx_c) = test_connection("c", 16);
        for conn in [&a, &b, &c] {
            local.register(conn).await;
        }
        local.join_group(a.id(), "G").await;
        local.join_group(b.id(), "G").await;

        let hello = HubMessage::client_call("Hello", vec![json!(1)]);
        let group = Target::Group {
            group: "G".into(),
            excluded: vec![],
        };
        assert_eq!(local.deliver_local(&group, &hello).await, 2);

        let others = Target::All {
            excluded: vec![a.id().clone()],
        };
        assert_eq!(local.deliver_local(&others, &hello).await, 2);

        let only_c = Target::Connection {
            connection_id: c.id().clone(),
        };
        assert_eq!(local.deliver_local(&only_c, &hello).await, 1);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(received(&mut rx_a).len(), 1);
        assert_eq!(received(&mut rx_b).len(), 2);
        assert_eq!(received(&mut rx_c).len(), 2);
    }

    #[tokio::test]
    async fn user_target_matches_identity() {
        let local = LocalDelivery::default();
        let (a, _rx) = test_connection("a", 16);
        local.register(&a).await;

        let anonymous = Target::User {
            user: hubwire_core::IdentityToken::ANONYMOUS.to_string(),
        };
        assert_eq!(local.deliver_local(&anonymous, &HubMessage::Ping).await, 1);
        let alice = Target::User {
            user: "alice".into(),
        };
        assert_eq!(local.deliver_local(&alice, &HubMessage::Ping).await, 0);
    }

    #[tokio::test]
    async fn unregister_leaves_groups() {
        let local = LocalDelivery::new(true);
        let (a, _rx) = test_connection("a", 16);
        local.register(&a).await;
        assert!(local.join_group(a.id(), "G").await);
        assert!(!local.join_group(&ConnectionId::from("ghost"), "G").await);

        local.unregister(a.id()).await;
        assert_eq!(local.connection_count().await, 0);
        assert!(!local.groups().contains_group("G").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_racing_disconnect_leaves_no_member() {
        for _ in 0..50 {
            let local = std::sync::Arc::new(LocalDelivery::new(true));
            let (a, _rx) = test_connection("a", 16);
            local.register(&a).await;

            let joins: Vec<_> = (0..8)
                .map(|_| {
                    let local = local.clone();
                    let id = a.id().clone();
                    tokio::spawn(async move { local.join_group(&id, "G").await })
                })
                .collect();
            local.unregister(a.id()).await;
            for join in joins {
                join.await.unwrap();
            }

            assert!(local.groups().members("G").await.is_empty());
            assert!(!local.join_group(a.id(), "G").await);
        }
    }

    #[test]
    fn target_serialization() {
        let target = Target::Group {
            group: "G".into(),
            excluded: vec![],
        };
        insta::assert_json_snapshot!(target, @r#"
        {
          "type": "group",
          "group": "G"
        }
        "#);
    }
}
