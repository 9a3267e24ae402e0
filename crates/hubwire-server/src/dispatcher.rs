//! Hub dispatcher.
//!
//! The [`Dispatcher`] owns every registered hub and routes decoded messages
//! from connections to them. Each invocation runs on its own task, so a slow
//! hub method never holds up the connection's read loop or other callers.
//! Results go back through the connection's ordered outbound queue.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hubwire_core::{ConnectionId, IdentityToken, InstanceId};
use hubwire_protocol::{Completion, HubMessage, Invocation, StreamItem};

use crate::config::ServerConfig;
use crate::connection::{CloseReason, Connection, ConnectionOptions};
use crate::context::HubContext;
use crate::delivery::{DeliveryBackend, LocalDelivery};
use crate::error::{HubError, ServerError, ServerResult};
use crate::hub::{Arguments, ClientStream, Handler, HubMethodTable, LifecycleHook};
use crate::negotiate::{AnonymousAuthenticator, Authenticator, HandshakeContext};
use crate::relay::{RelayDelivery, RelayHealth, RelayTransport};

/// One registered hub: its method table and delivery backend.
pub(crate) struct HubRuntime {
    pub(crate) path: String,
    pub(crate) methods: HubMethodTable,
    pub(crate) backend: Arc<dyn DeliveryBackend>,
}

impl HubRuntime {
    pub(crate) fn context(&self, connection: &Connection, token: CancellationToken) -> HubContext {
        HubContext::new(connection.clone(), self.backend.clone(), token)
    }

    /// Runs a lifecycle hook, containing panics.
    pub(crate) async fn run_hook(&self, hook: Option<&LifecycleHook>, connection: &Connection) {
        let Some(hook) = hook else { return };
        let ctx = self.context(connection, connection.child_token());
        if let Err(panic) = AssertUnwindSafe(async { hook(ctx).await })
            .catch_unwind()
            .await
        {
            error!(
                hub = %self.path,
                connection_id = %connection.id(),
                panic = %panic_message(panic.as_ref()),
                "Hub lifecycle hook panicked"
            );
        }
    }

    /// Executes one invocation and returns the Completion to send, if any.
    ///
    /// Invocations without an id produce no Completion. Streaming methods
    /// send their items directly to the connection; a cancelled stream
    /// produces nothing further. `uploads` are the channels opened for the
    /// invocation's stream ids; they are closed once the method returns.
    #[tracing::instrument(
        name = "invoke",
        skip_all,
        fields(
            hub = %self.path,
            connection_id = %connection.id(),
            target = %invocation.target,
            invocation_id = invocation.invocation_id.as_deref().unwrap_or("")
        )
    )]
    pub(crate) async fn invoke(
        &self,
        connection: &Connection,
        invocation: Invocation,
        uploads: Result<Vec<ClientStream>, HubError>,
        detailed_errors: bool,
    ) -> Option<Completion> {
        let uploads = match uploads {
            Ok(uploads) => uploads,
            Err(e) => {
                debug!(error = %e, "Rejected client streams");
                let message = failure_message(&invocation.target, &e, detailed_errors);
                return fail(&invocation.invocation_id, message);
            }
        };
        let stream_ids = invocation.stream_ids.clone();
        let completion = self
            .run(connection, invocation, uploads, detailed_errors)
            .await;
        connection.close_uploads(&stream_ids);
        completion
    }

    async fn run(
        &self,
        connection: &Connection,
        invocation: Invocation,
        uploads: Vec<ClientStream>,
        detailed_errors: bool,
    ) -> Option<Completion> {
        let Invocation {
            invocation_id,
            target,
            arguments,
            streaming,
            stream_ids,
        } = invocation;

        let Some(method) = self.methods.get(&target) else {
            warn!("Unknown hub method");
            return fail(&invocation_id, format!("Unknown hub method '{target}'"));
        };
        if streaming && !method.is_streaming() {
            return fail(
                &invocation_id,
                format!(
                    "The client attempted to invoke the non-streaming method '{}' in a streaming fashion.",
                    method.name()
                ),
            );
        }
        if !streaming && method.is_streaming() {
            return fail(
                &invocation_id,
                format!(
                    "The client attempted to invoke the streaming method '{}' in a non-streaming fashion.",
                    method.name()
                ),
            );
        }
        if let Err(e) = method.check_arguments(&arguments, stream_ids.len()) {
            debug!(error = %e, "Rejected invocation arguments");
            return fail(&invocation_id, failure_message(&target, &e, detailed_errors));
        }

        let arguments = Arguments::new(arguments).with_streams(uploads);
        match &method.handler {
            Handler::Unary(handler) => {
                let ctx = self.context(connection, connection.child_token());
                let outcome = AssertUnwindSafe(async { handler(ctx, arguments).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panicked(panic.as_ref())));

                let result = match outcome {
                    Ok(value) => value,
                    Err(e) => {
                        log_failure(&e);
                        return fail(&invocation_id, failure_message(&target, &e, detailed_errors));
                    }
                };
                let id = invocation_id?;
                Some(match result {
                    Some(value) => Completion::result(id, value),
                    None => Completion::void(id),
                })
            }
            Handler::Streaming(handler) => {
                let Some(id) = invocation_id else {
                    warn!("Streaming invocation without an id ignored");
                    return None;
                };
                let Some(token) = connection.register_stream(&id) else {
                    return Some(Completion::error(
                        &id,
                        format!("Invocation ID '{id}' is already in use."),
                    ));
                };
                let ctx = self.context(connection, token.clone());
                let completion = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler(ctx, arguments)
                })) {
                    Ok(items) => {
                        stream_items(connection, &id, &target, items, &token, detailed_errors).await
                    }
                    Err(panic) => {
                        let e = panicked(panic.as_ref());
                        log_failure(&e);
                        Some(Completion::error(&id, failure_message(&target, &e, detailed_errors)))
                    }
                };
                connection.finish_stream(&id);
                if completion.is_none() {
                    debug!("Stream cancelled");
                }
                completion
            }
        }
    }
}

async fn stream_items(
    connection: &Connection,
    id: &str,
    target: &str,
    items: crate::hub::ItemStream,
    token: &CancellationToken,
    detailed_errors: bool,
) -> Option<Completion> {
    let mut items = AssertUnwindSafe(items).catch_unwind();
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            next = items.next() => next,
        };
        match next {
            None => return Some(Completion::void(id)),
            Some(Ok(Ok(item))) => {
                let message = HubMessage::StreamItem(StreamItem::new(id, item));
                if let Err(e) = connection.send(&message) {
                    let e = HubError::internal(e.to_string());
                    log_failure(&e);
                    return Some(Completion::error(id, failure_message(target, &e, detailed_errors)));
                }
            }
            Some(Ok(Err(e))) => {
                log_failure(&e);
                return Some(Completion::error(id, failure_message(target, &e, detailed_errors)));
            }
            Some(Err(panic)) => {
                let e = panicked(panic.as_ref());
                log_failure(&e);
                return Some(Completion::error(id, failure_message(target, &e, detailed_errors)));
            }
        }
    }
}

fn fail(invocation_id: &Option<String>, message: String) -> Option<Completion> {
    match invocation_id {
        Some(id) => Some(Completion::error(id, message)),
        None => {
            debug!(error = %message, "Non-blocking invocation failed");
            None
        }
    }
}

/// The error text a client sees. Internal detail is only exposed when
/// detailed errors are enabled.
fn failure_message(target: &str, error: &HubError, detailed: bool) -> String {
    match error {
        HubError::InvalidArguments(message) => format!("Failed to invoke '{target}': {message}"),
        HubError::Hub(message) => {
            format!("An error occurred invoking '{target}' on the server. {message}")
        }
        HubError::Internal(message) if detailed => {
            format!("An unexpected error occurred invoking '{target}' on the server. {message}")
        }
        HubError::Internal(_) => {
            format!("An unexpected error occurred invoking '{target}' on the server.")
        }
    }
}

fn log_failure(error: &HubError) {
    match error {
        HubError::Internal(message) => error!(error = %message, "Hub method failed"),
        other => debug!(error = %other, "Hub method returned an error"),
    }
}

fn panicked(panic: &(dyn Any + Send)) -> HubError {
    HubError::internal(format!("hub method panicked: {}", panic_message(panic)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Hosts hubs and dispatches connection traffic to them.
///
/// Built by the bootstrap code: configure, register hubs, then hand it to a
/// listener (or drive connections directly with
/// [`Dispatcher::serve_connection`]).
///
/// ```rust
/// use hubwire_server::{Dispatcher, HubMethodTable, ParamKind, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), hubwire_server::ServerError> {
/// let mut dispatcher = Dispatcher::new(ServerConfig::default());
/// dispatcher.register_hub(
///     "/echo",
///     HubMethodTable::new().method("Echo", &[ParamKind::Any], |_ctx, args| async move {
///         Ok(args.value(0).cloned())
///     }),
/// )?;
/// assert_eq!(dispatcher.hub_paths(), vec!["/echo"]);
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    config: ServerConfig,
    instance: InstanceId,
    hubs: HashMap<String, Arc<HubRuntime>>,
    relay: Option<Arc<dyn RelayTransport>>,
    authenticator: Arc<dyn Authenticator>,
    /// Cancels relay subscribers when the dispatcher is dropped.
    background: CancellationToken,
    pub(crate) connection_slots: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(config: ServerConfig) -> Self {
        let connection_slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            instance: InstanceId::generate(),
            hubs: HashMap::new(),
            relay: None,
            authenticator: Arc::new(AnonymousAuthenticator),
            background: CancellationToken::new(),
            connection_slots,
        }
    }

    /// Builder: mirror delivery of hubs registered afterwards through `relay`.
    pub fn with_relay(mut self, relay: Arc<dyn RelayTransport>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Builder: set the id this instance publishes relay envelopes under.
    pub fn with_instance_id(mut self, instance: InstanceId) -> Self {
        self.instance = instance;
        self
    }

    /// Builder: set the authenticator consulted before each handshake.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Registers a hub at `path`.
    ///
    /// With a relay configured this spawns the hub's relay subscriber, so it
    /// must be called from within a Tokio runtime.
    pub fn register_hub(&mut self, path: &str, methods: HubMethodTable) -> ServerResult<()> {
        let path = normalize_path(path);
        if self.hubs.contains_key(&path) {
            return Err(ServerError::DuplicateHub { path });
        }

        let local = LocalDelivery::new(self.config.reap_empty_groups);
        let backend: Arc<dyn DeliveryBackend> = match &self.relay {
            Some(relay) => {
                let delivery =
                    RelayDelivery::new(path.clone(), self.instance.clone(), local, relay.clone());
                delivery.spawn_subscriber(self.background.child_token());
                delivery
            }
            None => Arc::new(local),
        };

        info!(
            hub = %path,
            methods = methods.len(),
            relay = self.relay.is_some(),
            "Registered hub"
        );
        self.hubs.insert(
            path.clone(),
            Arc::new(HubRuntime {
                path,
                methods,
                backend,
            }),
        );
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    /// Registered hub paths, sorted.
    pub fn hub_paths(&self) -> Vec<&str> {
        let mut paths: Vec<_> = self.hubs.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub(crate) fn hub(&self, path: &str) -> ServerResult<Arc<HubRuntime>> {
        self.hubs
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| ServerError::unknown_hub(path))
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            outbound_capacity: self.config.outbound_capacity,
            max_message_size: self.config.max_message_size,
            close_flush_timeout: self.config.close_flush_timeout,
        }
    }

    /// Resolves the identity of a connection attempt.
    ///
    /// Fails with [`ServerError::UnknownHub`] before consulting the
    /// authenticator if no hub is registered at the requested path.
    pub async fn authenticate(&self, context: &HandshakeContext) -> ServerResult<IdentityToken> {
        self.hub(&context.hub_path)?;
        let identity = self.authenticator.authenticate(context).await?;
        debug!(hub = %context.hub_path, identity = %identity, "Authenticated connection attempt");
        Ok(identity)
    }

    /// Relay health, if a relay is configured.
    pub fn relay_health(&self) -> Option<watch::Receiver<RelayHealth>> {
        self.relay.as_ref().map(|relay| relay.health())
    }

    /// Connections currently open on this instance, across all hubs.
    pub async fn connection_count(&self) -> usize {
        let mut count = 0;
        for hub in self.hubs.values() {
            count += hub.backend.local().connection_count().await;
        }
        count
    }

    /// Local members of `group` in the hub at `hub_path`.
    pub async fn group_members(
        &self,
        hub_path: &str,
        group: &str,
    ) -> ServerResult<Vec<ConnectionId>> {
        let hub = self.hub(hub_path)?;
        Ok(hub.backend.local().groups().members(group).await)
    }

    /// Closes every local connection of every hub.
    pub async fn close_all(&self, reason: CloseReason) {
        for hub in self.hubs.values() {
            hub.backend.local().close_all(reason.clone()).await;
        }
    }

    /// Closes every connection with [`CloseReason::ServerShutdown`] and waits
    /// for their transports to be released.
    pub async fn shutdown(&self) {
        let mut connections = Vec::new();
        for hub in self.hubs.values() {
            connections.extend(hub.backend.local().connections().await);
        }
        info!(connections = connections.len(), "Closing all connections");
        for connection in &connections {
            connection.close(CloseReason::ServerShutdown);
        }
        // Writers bound their own flush; this only caps a stuck transport close.
        let wait = futures_util::future::join_all(connections.iter().map(|c| c.closed()));
        if tokio::time::timeout(self.config.close_flush_timeout * 2, wait)
            .await
            .is_err()
        {
            warn!("Some connections did not close in time");
        }
        self.background.cancel();
    }

    /// Handles one decoded message from `connection`.
    ///
    /// Invocations are spawned and complete asynchronously; everything else
    /// is handled inline.
    pub fn dispatch(&self, connection: &Connection, message: HubMessage) -> ServerResult<()> {
        let hub = self.hub(connection.hub())?;
        self.dispatch_to(&hub, connection, message);
        Ok(())
    }

    pub(crate) fn dispatch_to(
        &self,
        hub: &Arc<HubRuntime>,
        connection: &Connection,
        message: HubMessage,
    ) {
        match message {
            HubMessage::Invocation(invocation) => {
                let hub = hub.clone();
                let connection = connection.clone();
                let detailed_errors = self.config.detailed_errors;
                // Opened before spawning so items read right after the
                // invocation find their channel.
                let uploads = connection.open_uploads(&invocation.stream_ids);
                tokio::spawn(async move {
                    let Some(completion) = hub
                        .invoke(&connection, invocation, uploads, detailed_errors)
                        .await
                    else {
                        return;
                    };
                    let id = completion.invocation_id.clone();
                    if let Err(e) = connection.send(&HubMessage::Completion(completion)) {
                        warn!(connection_id = %connection.id(), invocation_id = %id, error = %e, "Failed to encode completion");
                        let fallback = Completion::error(id, "Failed to serialize the invocation result.");
                        let _ = connection.send(&HubMessage::Completion(fallback));
                    }
                });
            }
            HubMessage::CancelInvocation { invocation_id } => {
                if connection.cancel_stream(&invocation_id) {
                    debug!(connection_id = %connection.id(), invocation_id = %invocation_id, "Stream cancelled by client");
                } else {
                    debug!(connection_id = %connection.id(), invocation_id = %invocation_id, "Cancel for unknown stream ignored");
                }
            }
            HubMessage::Completion(completion) => {
                if connection.complete_upload(&completion) {
                    debug!(connection_id = %connection.id(), stream_id = %completion.invocation_id, "Client stream completed");
                    return;
                }
                let id = completion.invocation_id.clone();
                if !connection.resolve_result(completion) {
                    debug!(connection_id = %connection.id(), invocation_id = %id, "Unexpected client result ignored");
                }
            }
            HubMessage::StreamItem(item) => {
                let id = item.invocation_id.clone();
                if !connection.push_upload(item) {
                    debug!(connection_id = %connection.id(), stream_id = %id, "Item for unknown client stream ignored");
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close(close) => {
                if let Some(error) = &close.error {
                    debug!(connection_id = %connection.id(), error = %error, "Client closed with error");
                }
                connection.close(CloseReason::ClientClosed);
            }
        }
    }

    /// Runs one invocation to completion on `connection` and returns the
    /// Completion instead of sending it.
    pub async fn invoke(
        &self,
        connection: &Connection,
        invocation: Invocation,
    ) -> ServerResult<Option<Completion>> {
        let hub = self.hub(connection.hub())?;
        let uploads = connection.open_uploads(&invocation.stream_ids);
        Ok(hub
            .invoke(connection, invocation, uploads, self.config.detailed_errors)
            .await)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use crate::hub::ParamKind;
    use hubwire_protocol::{CompletionOutcome, HubProtocol, HubValue};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn methods() -> HubMethodTable {
        HubMethodTable::new()
            .method("Echo", &[ParamKind::Any], |_ctx, args| async move {
                Ok(args.value(0).cloned())
            })
            .method("Nothing", &[], |_ctx, _args| async move { Ok(None) })
            .method("Fail", &[], |_ctx, _args| async move {
                Err(HubError::internal("database password is hunter2"))
            })
            .method("Refuse", &[], |_ctx, _args| async move {
                Err(HubError::hub("not today"))
            })
            .method("Explode", &[], |_ctx, _args| async move {
                if true {
                    panic!("boom");
                }
                Ok(None)
            })
            .stream("Count", &[ParamKind::Integer], |_ctx, args| {
                let n: u64 = args.get(0).unwrap_or(0);
                futures_util::stream::iter((1..=n).map(|i| Ok(HubValue::from(i))))
            })
            .stream("Forever", &[], |_ctx, _args| {
                futures_util::stream::unfold(0u64, |i| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(HubValue::from(i)), i + 1))
                })
            })
            .method("Sum", &[ParamKind::Stream], |_ctx, mut args| async move {
                let mut items = args.stream(0)?;
                let mut total = 0;
                while let Some(item) = items.next().await {
                    total += item?.as_i64().unwrap_or(0);
                }
                Ok(Some(HubValue::from(total)))
            })
    }

    fn dispatcher(detailed: bool) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(ServerConfig::default().with_detailed_errors(detailed));
        dispatcher.register_hub("hub", methods()).unwrap();
        dispatcher
    }

    fn decode_all(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<HubMessage> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| HubProtocol::Json.decode(&frame).unwrap().unwrap().0)
            .collect()
    }

    async fn call(dispatcher: &Dispatcher, conn: &Connection, target: &str, args: Vec<Value>) -> Completion {
        dispatcher
            .invoke(conn, Invocation::new("1", target, args))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("chat"), "/chat");
        assert_eq!(normalize_path("/chat/"), "/chat");
        assert_eq!(normalize_path("/"), "/");
    }

    #[tokio::test]
    async fn duplicate_hub_is_rejected() {
        let mut dispatcher = dispatcher(false);
        assert!(matches!(
            dispatcher.register_hub("/hub/", HubMethodTable::new()),
            Err(ServerError::DuplicateHub { .. })
        ));
    }

    #[tokio::test]
    async fn unary_results() {
        let dispatcher = dispatcher(false);
        let (conn, _rx) = test_connection("c1", 16);

        assert_eq!(
            call(&dispatcher, &conn, "echo", vec![json!("hi")]).await,
            Completion::result("1", json!("hi"))
        );
        assert_eq!(
            call(&dispatcher, &conn, "Nothing", vec![]).await,
            Completion::void("1")
        );
    }

    #[tokio::test]
    async fn unknown_method_and_bad_arguments() {
        let dispatcher = dispatcher(false);
        let (conn, _rx) = test_connection("c1", 16);

        let completion = call(&dispatcher, &conn, "Missing", vec![]).await;
        assert_eq!(completion.error_message(), Some("Unknown hub method 'Missing'"));

        let completion = call(&dispatcher, &conn, "Echo", vec![]).await;
        assert_eq!(
            completion.error_message(),
            Some("Failed to invoke 'Echo': Invocation provides 0 argument(s) but target expects 1.")
        );
        assert!(!conn.is_closing());
    }

    #[tokio::test]
    async fn internal_errors_are_sanitized() {
        let (conn, _rx) = test_connection("c1", 16);

        let completion = call(&dispatcher(false), &conn, "Fail", vec![]).await;
        insta::assert_snapshot!(completion.error_message().unwrap(), @"An unexpected error occurred invoking 'Fail' on the server.");

        let completion = call(&dispatcher(true), &conn, "Fail", vec![]).await;
        assert!(completion.error_message().unwrap().contains("hunter2"));

        let completion = call(&dispatcher(false), &conn, "Refuse", vec![]).await;
        assert_eq!(
            completion.error_message(),
            Some("An error occurred invoking 'Refuse' on the server. not today")
        );
    }

    #[tokio::test]
    async fn panics_become_error_completions() {
        let dispatcher = dispatcher(false);
        let (conn, _rx) = test_connection("c1", 16);
        let completion = call(&dispatcher, &conn, "Explode", vec![]).await;
        assert!(completion.is_error());
        assert!(!completion.error_message().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn streaming_mismatch() {
        let dispatcher = dispatcher(false);
        let (conn, _rx) = test_connection("c1", 16);

        let completion = call(&dispatcher, &conn, "Count", vec![json!(2)]).await;
        assert!(completion.error_message().unwrap().contains("non-streaming fashion"));

        let completion = dispatcher
            .invoke(&conn, Invocation::streaming("2", "Echo", vec![json!(1)]))
            .await
            .unwrap()
            .unwrap();
        assert!(completion.error_message().unwrap().contains("in a streaming fashion"));
    }

    #[tokio::test]
    async fn uploaded_items_reach_the_method() {
        let dispatcher = dispatcher(false);
        let (conn, mut rx) = test_connection("c1", 16);

        let sum = Invocation::new("1", "Sum", Vec::<HubValue>::new()).with_stream_ids(["0"]);
        dispatcher.dispatch(&conn, HubMessage::Invocation(sum)).unwrap();
        for i in 1..=4 {
            dispatcher
                .dispatch(&conn, HubMessage::StreamItem(StreamItem::new("0", json!(i))))
                .unwrap();
        }
        dispatcher
            .dispatch(&conn, HubMessage::Completion(Completion::void("0")))
            .unwrap();

        let completion = HubProtocol::Json.decode(&rx.recv().await.unwrap()).unwrap().unwrap().0;
        assert_eq!(completion, HubMessage::Completion(Completion::result("1", json!(10))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.active_uploads(), 0);
    }

    #[tokio::test]
    async fn upload_errors_and_mismatched_stream_ids() {
        let dispatcher = dispatcher(false);
        let (conn, mut rx) = test_connection("c1", 16);

        let sum = Invocation::new("1", "Sum", Vec::<HubValue>::new()).with_stream_ids(["0"]);
        dispatcher.dispatch(&conn, HubMessage::Invocation(sum)).unwrap();
        dispatcher
            .dispatch(&conn, HubMessage::Completion(Completion::error("0", "disk full")))
            .unwrap();
        let HubMessage::Completion(completion) =
            HubProtocol::Json.decode(&rx.recv().await.unwrap()).unwrap().unwrap().0
        else {
            panic!("expected completion");
        };
        assert_eq!(
            completion.error_message(),
            Some("An error occurred invoking 'Sum' on the server. Client stream '0' failed: disk full")
        );

        let upload = Invocation::new("2", "Echo", vec![json!(1)]).with_stream_ids(["s"]);
        let completion = dispatcher.invoke(&conn, upload).await.unwrap().unwrap();
        assert_eq!(
            completion.error_message(),
            Some("Failed to invoke 'Echo': Invocation provides 2 argument(s) but target expects 1.")
        );

        let missing = Invocation::new("3", "Sum", vec![json!(1)]);
        let completion = dispatcher.invoke(&conn, missing).await.unwrap().unwrap();
        assert_eq!(
            completion.error_message(),
            Some("Failed to invoke 'Sum': Client sent 0 stream(s), Hub method expects 1.")
        );
        assert_eq!(conn.active_uploads(), 0);
    }

    #[tokio::test]
    async fn stream_items_precede_completion() {
        let dispatcher = dispatcher(false);
        let (conn, mut rx) = test_connection("c1", 16);

        let completion = dispatcher
            .invoke(&conn, Invocation::streaming("7", "Count", vec![json!(3)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion, Completion::void("7"));
        assert_eq!(conn.active_streams(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let items: Vec<_> = decode_all(&mut rx)
            .into_iter()
            .map(|message| match message {
                HubMessage::StreamItem(item) => item.item,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn cancel_stops_stream_without_completion() {
        let dispatcher = Arc::new(dispatcher(false));
        let (conn, mut rx) = test_connection("c1", 256);

        dispatcher
            .dispatch(
                &conn,
                HubMessage::Invocation(Invocation::streaming(
                    "s",
                    "Forever",
                    Vec::<HubValue>::new(),
                )),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        dispatcher
            .dispatch(&conn, HubMessage::CancelInvocation { invocation_id: "s".into() })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.active_streams(), 0);

        let before = decode_all(&mut rx);
        assert!(!before.is_empty());
        assert!(before.iter().all(|m| matches!(m, HubMessage::StreamItem(_))));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(decode_all(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn client_result_is_routed_to_pending_call() {
        let dispatcher = dispatcher(false);
        let (conn, mut rx) = test_connection("c1", 16);

        let caller = conn.clone();
        let pending =
            tokio::spawn(async move { caller.invoke("Ask", Vec::<HubValue>::new()).await });
        let HubMessage::Invocation(inv) =
            HubProtocol::Json.decode(&rx.recv().await.unwrap()).unwrap().unwrap().0
        else {
            panic!("expected invocation");
        };

        let result = Completion::result(inv.invocation_id.unwrap(), json!("answer"));
        dispatcher.dispatch(&conn, HubMessage::Completion(result)).unwrap();
        let completion = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(completion.outcome, CompletionOutcome::Result(json!("answer").into()));
    }

    #[tokio::test]
    async fn close_message_closes_connection() {
        let dispatcher = dispatcher(false);
        let (conn, _rx) = test_connection("c1", 16);
        dispatcher
            .dispatch(&conn, HubMessage::Close(hubwire_protocol::Close::normal()))
            .unwrap();
        assert_eq!(conn.close_reason(), Some(CloseReason::ClientClosed));
    }

    #[tokio::test]
    async fn unknown_hub_fails_authentication() {
        let dispatcher = dispatcher(false);
        assert!(matches!(
            dispatcher.authenticate(&HandshakeContext::new("/nope")).await,
            Err(ServerError::UnknownHub { .. })
        ));
        assert!(dispatcher
            .authenticate(&HandshakeContext::new("/hub"))
            .await
            .unwrap()
            .is_anonymous());
    }
}
