//! One client connection: identity, lifecycle state and the ordered outbound queue.
//!
//! Every frame sent to a connection goes through a bounded single-consumer
//! queue drained by a dedicated writer task, so frames reach the transport in
//! enqueue order no matter how many invocations are sending concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubwire_core::{ConnectionId, IdentityToken};
use hubwire_protocol::{
    Close, Completion, CompletionOutcome, HubCodec, HubMessage, HubProtocol, HubValue,
    Invocation, StreamItem,
};

use crate::error::{HubError, ServerError, ServerResult};
use crate::hub::ClientStream;
use crate::transport::TransportWriter;

type UploadSender = mpsc::UnboundedSender<Result<HubValue, HubError>>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the server without error.
    Normal,
    /// The client sent Close or ended the transport.
    ClientClosed,
    /// The client sent a frame that could not be decoded.
    ProtocolError(String),
    /// Nothing was received within the client timeout.
    Timeout,
    /// The outbound queue overflowed.
    SlowConsumer,
    /// Reading from or writing to the transport failed.
    TransportFailure(String),
    /// The server is shutting down.
    ServerShutdown,
}

impl CloseReason {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Normal | Self::ClientClosed | Self::ServerShutdown)
    }

    /// The Close frame sent to the client, if the transport is still usable.
    fn close_message(&self) -> Option<Close> {
        match self {
            Self::ClientClosed | Self::TransportFailure(_) => None,
            Self::Normal => Some(Close::normal()),
            Self::ServerShutdown => Some(Close {
                error: None,
                allow_reconnect: true,
            }),
            Self::ProtocolError(message) => Some(Close::with_error(format!(
                "Connection closed with an error. {message}"
            ))),
            Self::Timeout => Some(Close::with_error(
                "Server timeout elapsed without receiving a message from the client.",
            )),
            Self::SlowConsumer => Some(Close::with_error(
                "Connection closed because the outbound queue is full.",
            )),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::ClientClosed => f.write_str("client closed"),
            Self::ProtocolError(message) => write!(f, "protocol error: {message}"),
            Self::Timeout => f.write_str("timeout"),
            Self::SlowConsumer => f.write_str("slow consumer"),
            Self::TransportFailure(message) => write!(f, "transport failure: {message}"),
            Self::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

/// Settings a connection takes from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub outbound_capacity: usize,
    pub max_message_size: usize,
    pub close_flush_timeout: Duration,
}

/// Handle to a connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    hub: String,
    protocol: HubProtocol,
    identity: IdentityToken,
    connected_at: DateTime<Utc>,
    codec: Box<dyn HubCodec + Send + Sync>,
    state: AtomicU8,
    outbound: mpsc::Sender<Vec<u8>>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancelled when the connection starts closing.
    shutdown: CancellationToken,
    /// Cancelled once the writer task has released the transport.
    terminated: CancellationToken,
    streams: Mutex<HashMap<String, CancellationToken>>,
    pending_results: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
    /// Client-to-server streams, keyed by the client's stream id.
    uploads: Mutex<HashMap<String, UploadSender>>,
    next_invocation_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    /// Creates a connection in the `Connecting` state and spawns its writer task.
    pub fn spawn<W: TransportWriter>(
        id: ConnectionId,
        hub: impl Into<String>,
        protocol: HubProtocol,
        identity: IdentityToken,
        mut writer: W,
        options: &ConnectionOptions,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.outbound_capacity.max(1));
        let inner = Arc::new(Inner {
            id,
            hub: hub.into(),
            protocol,
            identity,
            connected_at: Utc::now(),
            codec: protocol.codec(options.max_message_size),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound: tx,
            close_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
            streams: Mutex::new(HashMap::new()),
            pending_results: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_invocation_id: AtomicU64::new(0),
        });

        writer.set_binary(protocol.is_binary());
        let task = tokio::spawn(write_loop(
            inner.clone(),
            rx,
            writer,
            options.close_flush_timeout,
        ));
        (Self { inner }, task)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Path of the hub this connection belongs to.
    pub fn hub(&self) -> &str {
        &self.inner.hub
    }

    pub fn protocol(&self) -> HubProtocol {
        self.inner.protocol
    }

    pub fn identity(&self) -> &IdentityToken {
        &self.inner.identity
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The reason passed to the first [`Connection::close`] call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.inner.close_reason).clone()
    }

    /// Moves a `Connecting` connection to `Connected`.
    pub fn mark_connected(&self) {
        let _ = self.inner.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Enqueues a message for ordered delivery.
    ///
    /// Sends to a closing or closed connection are dropped and logged. A full
    /// queue closes the connection as a slow consumer. Only encoding failures
    /// are reported to the caller.
    pub fn send(&self, message: &HubMessage) -> ServerResult<()> {
        let frame = self.inner.codec.encode(message).map_err(ServerError::from)?;
        self.send_frame(frame, message.kind_name());
        Ok(())
    }

    fn send_frame(&self, frame: Vec<u8>, kind: &'static str) {
        if self.inner.shutdown.is_cancelled() {
            debug!(connection_id = %self.inner.id, kind, "Dropping send to closing connection");
            return;
        }
        match self.inner.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.inner.id,
                    kind,
                    "Outbound queue full, closing slow consumer"
                );
                self.close(CloseReason::SlowConsumer);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection_id = %self.inner.id, kind, "Dropping send to closed connection");
            }
        }
    }

    /// Starts closing the connection. Only the first call has an effect.
    ///
    /// In-flight streams are cancelled, pending client results and uploads
    /// fail, queued frames are flushed best-effort, and the writer task moves
    /// the connection to `Closed` once the transport is shut.
    pub fn close(&self, reason: CloseReason) {
        let previous = self.inner.state.fetch_max(
            ConnectionState::Disconnecting as u8,
            Ordering::AcqRel,
        );
        if previous >= ConnectionState::Disconnecting as u8 {
            return;
        }

        let id = &self.inner.id;
        if reason.is_error() {
            warn!(connection_id = %id, hub = %self.inner.hub, reason = %reason, "Closing connection");
        } else {
            info!(connection_id = %id, hub = %self.inner.hub, reason = %reason, "Closing connection");
        }
        *lock(&self.inner.close_reason) = Some(reason);
        self.inner.shutdown.cancel();
        // Cleared after cancelling so a concurrent invoke() either sees the
        // cancellation or has its entry dropped here.
        lock(&self.inner.pending_results).clear();
        for (_, upload) in lock(&self.inner.uploads).drain() {
            let _ = upload.send(Err(HubError::hub(
                "Connection closed before the stream completed.",
            )));
        }
    }

    /// Completes once the connection has started closing.
    pub async fn closing(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Completes once the connection is `Closed` and the transport released.
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await
    }

    pub fn is_closing(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// A token cancelled when the connection starts closing.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Registers a streaming invocation and returns its cancellation token.
    ///
    /// The token is a child of the connection, so closing the connection
    /// cancels it too. Returns `None` if the id is already streaming.
    pub(crate) fn register_stream(&self, invocation_id: &str) -> Option<CancellationToken> {
        let mut streams = lock(&self.inner.streams);
        if streams.contains_key(invocation_id) {
            return None;
        }
        let token = self.inner.shutdown.child_token();
        streams.insert(invocation_id.to_string(), token.clone());
        Some(token)
    }

    pub(crate) fn cancel_stream(&self, invocation_id: &str) -> bool {
        match lock(&self.inner.streams).remove(invocation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn finish_stream(&self, invocation_id: &str) {
        lock(&self.inner.streams).remove(invocation_id);
    }

    pub fn active_streams(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Opens one upload channel per stream id, all or none.
    ///
    /// Fails if an id is repeated or already streaming on this connection.
    pub(crate) fn open_uploads(
        &self,
        stream_ids: &[String],
    ) -> Result<Vec<ClientStream>, HubError> {
        if stream_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut uploads = lock(&self.inner.uploads);
        for (i, id) in stream_ids.iter().enumerate() {
            if uploads.contains_key(id) || stream_ids[..i].contains(id) {
                return Err(HubError::invalid_arguments(format!(
                    "Stream ID '{id}' is already in use."
                )));
            }
        }
        if self.is_closing() {
            return Err(HubError::hub("Connection is closing."));
        }
        Ok(stream_ids
            .iter()
            .map(|id| {
                let (tx, rx) = mpsc::unbounded_channel();
                uploads.insert(id.clone(), tx);
                ClientStream::new(id.clone(), rx)
            })
            .collect())
    }

    /// Forwards a client StreamItem to its upload. Returns false for unknown ids.
    pub(crate) fn push_upload(&self, item: StreamItem) -> bool {
        match lock(&self.inner.uploads).get(&item.invocation_id) {
            // The method may have stopped reading; the item is dropped then.
            Some(upload) => {
                let _ = upload.send(Ok(item.item));
                true
            }
            None => false,
        }
    }

    /// Ends an upload on the client's Completion. An error completion reaches
    /// the method as a failed item.
    pub(crate) fn complete_upload(&self, completion: &Completion) -> bool {
        let Some(upload) = lock(&self.inner.uploads).remove(&completion.invocation_id) else {
            return false;
        };
        if let CompletionOutcome::Error(message) = &completion.outcome {
            let _ = upload.send(Err(HubError::hub(format!(
                "Client stream '{}' failed: {message}",
                completion.invocation_id
            ))));
        }
        true
    }

    /// Drops the uploads of a finished invocation.
    pub(crate) fn close_uploads(&self, stream_ids: &[String]) {
        if stream_ids.is_empty() {
            return;
        }
        let mut uploads = lock(&self.inner.uploads);
        for id in stream_ids {
            uploads.remove(id);
        }
    }

    pub fn active_uploads(&self) -> usize {
        lock(&self.inner.uploads).len()
    }

    /// Invokes a method on this client and waits for its Completion.
    ///
    /// Returns `None` if the connection closes before the client answers.
    pub async fn invoke(
        &self,
        target: &str,
        arguments: impl IntoIterator<Item = impl Into<HubValue>>,
    ) -> ServerResult<Option<Completion>> {
        let id = self
            .inner
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending_results).insert(id.clone(), tx);
        if self.is_closing() {
            lock(&self.inner.pending_results).remove(&id);
            return Ok(None);
        }

        let message = HubMessage::Invocation(Invocation::new(id.clone(), target, arguments));
        if let Err(e) = self.send(&message) {
            lock(&self.inner.pending_results).remove(&id);
            return Err(e);
        }
        Ok(rx.await.ok())
    }

    /// Routes a client Completion to the waiting [`Connection::invoke`] call.
    pub(crate) fn resolve_result(&self, completion: Completion) -> bool {
        match lock(&self.inner.pending_results).remove(&completion.invocation_id) {
            Some(tx) => tx.send(completion).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("hub", &self.inner.hub)
            .field("protocol", &self.inner.protocol)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_loop<W: TransportWriter>(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: W,
    flush_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let result = tokio::select! {
            biased;
            result = writer.send(frame) => result,
            _ = inner.shutdown.cancelled() => break,
        };
        if let Err(e) = result {
            Connection {
                inner: inner.clone(),
            }
            .close(CloseReason::TransportFailure(e.to_string()));
            break;
        }
    }

    let reason = lock(&inner.close_reason)
        .clone()
        .unwrap_or(CloseReason::Normal);
    if !matches!(reason, CloseReason::TransportFailure(_) | CloseReason::ClientClosed) {
        rx.close();
        let flush = async {
            while let Some(frame) = rx.recv().await {
                writer.send(frame).await?;
            }
            if let Some(close) = reason.close_message() {
                let frame = inner
                    .codec
                    .encode(&HubMessage::Close(close))
                    .map_err(std::io::Error::other)?;
                writer.send(frame).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(flush_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection_id = %inner.id, error = %e, "Flush on close failed"),
            Err(_) => debug!(connection_id = %inner.id, "Flush on close timed out"),
        }
    }

    if let Err(e) = writer.close().await {
        debug!(connection_id = %inner.id, error = %e, "Transport close failed");
    }
    inner
        .state
        .store(ConnectionState::Closed as u8, Ordering::Release);
    inner.terminated.cancel();
    debug!(connection_id = %inner.id, "Connection closed");
}
