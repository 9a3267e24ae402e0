//! What a hub method sees of the server while it runs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use hubwire_core::{ConnectionId, IdentityToken};
use hubwire_protocol::{CompletionOutcome, HubMessage, HubValue};

use crate::connection::Connection;
use crate::delivery::{DeliveryBackend, Target};
use crate::error::HubError;

/// Per-invocation context handed to hub methods and lifecycle hooks.
#[derive(Clone)]
pub struct HubContext {
    connection: Connection,
    backend: Arc<dyn DeliveryBackend>,
    cancellation: CancellationToken,
}

impl HubContext {
    pub(crate) fn new(
        connection: Connection,
        backend: Arc<dyn DeliveryBackend>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            connection,
            backend,
            cancellation,
        }
    }

    /// The calling connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn identity(&self) -> &IdentityToken {
        self.connection.identity()
    }

    pub fn hub(&self) -> &str {
        self.connection.hub()
    }

    /// Set when the invocation was cancelled or the connection is closing.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Selects which clients a message goes to.
    pub fn clients(&self) -> HubClients<'_> {
        HubClients { ctx: self }
    }

    /// Group membership operations.
    pub fn groups(&self) -> GroupManager<'_> {
        GroupManager { ctx: self }
    }

    /// Invokes a method on the caller and waits for its result.
    pub async fn invoke_caller(
        &self,
        method: &str,
        arguments: impl IntoIterator<Item = impl Into<HubValue>>,
    ) -> Result<HubValue, HubError> {
        invoke_on(&self.connection, method, arguments).await
    }

    /// Invokes a method on another connection of this hub instance.
    pub async fn invoke_client(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        arguments: impl IntoIterator<Item = impl Into<HubValue>>,
    ) -> Result<HubValue, HubError> {
        let connection = self
            .backend
            .local()
            .connection(connection_id)
            .await
            .ok_or_else(|| HubError::hub(format!("Connection '{connection_id}' not found.")))?;
        invoke_on(&connection, method, arguments).await
    }
}

async fn invoke_on(
    connection: &Connection,
    method: &str,
    arguments: impl IntoIterator<Item = impl Into<HubValue>>,
) -> Result<HubValue, HubError> {
    let completion = connection
        .invoke(method, arguments)
        .await
        .map_err(|e| HubError::internal(e.to_string()))?
        .ok_or_else(|| HubError::hub("Connection closed before the client returned a result."))?;
    match completion.outcome {
        CompletionOutcome::Result(value) => Ok(value),
        CompletionOutcome::Void => Ok(HubValue::NULL),
        CompletionOutcome::Error(message) => Err(HubError::hub(message)),
    }
}

/// Target selectors, mirroring the delivery targets the backend understands.
pub struct HubClients<'a> {
    ctx: &'a HubContext,
}

impl<'a> HubClients<'a> {
    fn proxy(&self, target: Target) -> ClientProxy<'a> {
        ClientProxy {
            backend: self.ctx.backend.as_ref(),
            target,
        }
    }

    /// The calling connection.
    pub fn caller(&self) -> ClientProxy<'a> {
        self.client(self.ctx.connection_id().clone())
    }

    pub fn all(&self) -> ClientProxy<'a> {
        self.all_except(Vec::new())
    }

    pub fn all_except(&self, excluded: Vec<ConnectionId>) -> ClientProxy<'a> {
        self.proxy(Target::All { excluded })
    }

    /// Everyone but the caller.
    pub fn others(&self) -> ClientProxy<'a> {
        self.all_except(vec![self.ctx.connection_id().clone()])
    }

    pub fn client(&self, connection_id: ConnectionId) -> ClientProxy<'a> {
        self.proxy(Target::Connection { connection_id })
    }

    pub fn group(&self, group: impl Into<String>) -> ClientProxy<'a> {
        self.group_except(group, Vec::new())
    }

    pub fn group_except(
        &self,
        group: impl Into<String>,
        excluded: Vec<ConnectionId>,
    ) -> ClientProxy<'a> {
        self.proxy(Target::Group {
            group: group.into(),
            excluded,
        })
    }

    /// Group members other than the caller.
    pub fn others_in_group(&self, group: impl Into<String>) -> ClientProxy<'a> {
        self.group_except(group, vec![self.ctx.connection_id().clone()])
    }

    /// Every connection authenticated as `user`.
    pub fn user(&self, user: impl Into<String>) -> ClientProxy<'a> {
        self.proxy(Target::User { user: user.into() })
    }
}

/// Sends client method calls to a selected set of connections.
pub struct ClientProxy<'a> {
    backend: &'a dyn DeliveryBackend,
    target: Target,
}

impl ClientProxy<'_> {
    /// Fire-and-forget invocation of a client method.
    pub async fn send(
        &self,
        method: &str,
        arguments: impl IntoIterator<Item = impl Into<HubValue>>,
    ) {
        let message = HubMessage::client_call(method, arguments);
        self.backend.deliver(&self.target, &message).await;
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

/// Adds and removes connections from groups of the current hub.
pub struct GroupManager<'a> {
    ctx: &'a HubContext,
}

impl GroupManager<'_> {
    /// Adds the caller to `group`.
    pub async fn join(&self, group: &str) {
        self.add(self.ctx.connection_id(), group).await
    }

    /// Removes the caller from `group`.
    pub async fn leave(&self, group: &str) {
        self.remove(self.ctx.connection_id(), group).await
    }

    pub async fn add(&self, connection_id: &ConnectionId, group: &str) {
        if group.is_empty() {
            warn!(connection_id = %connection_id, "Ignoring join of empty group name");
            return;
        }
        self.ctx.backend.add_to_group(connection_id, group).await
    }

    pub async fn remove(&self, connection_id: &ConnectionId, group: &str) {
        self.ctx.backend.remove_from_group(connection_id, group).await
    }
}
