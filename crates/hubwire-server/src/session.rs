//! Per-connection inbound loop.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hubwire_core::{ConnectionId, IdentityToken};
use hubwire_protocol::{
    FrameBuffer, HandshakeResponse, HubMessage, encode_handshake_response,
};

use crate::connection::{CloseReason, Connection};
use crate::dispatcher::{Dispatcher, HubRuntime};
use crate::error::{ServerError, ServerResult};
use crate::negotiate::{HandshakeContext, negotiate};
use crate::transport::{TransportReader, TransportWriter, split_stream};

impl Dispatcher {
    /// Serves one client of the hub at `hub_path` until it disconnects.
    ///
    /// The transport must already be authenticated; `identity` is attached
    /// to the connection for its whole life. Runs the handshake, registers
    /// the connection with the hub's delivery backend, then reads and
    /// dispatches frames. Returns once the connection is closed and its
    /// resources released. Errors are only returned for failures before
    /// the connection is established.
    pub async fn serve_connection<R, W>(
        &self,
        hub_path: &str,
        identity: IdentityToken,
        mut reader: R,
        mut writer: W,
    ) -> ServerResult<()>
    where
        R: TransportReader,
        W: TransportWriter,
    {
        let hub = self.hub(hub_path)?;
        let Ok(_permit) = self.connection_slots.clone().try_acquire_owned() else {
            let max = self.config().max_connections;
            warn!(hub = %hub.path, max, "Connection limit reached, rejecting client");
            if let Ok(response) = encode_handshake_response(&HandshakeResponse::rejected(
                "The server has reached its connection limit.",
            )) {
                let _ = writer.send(response).await;
            }
            let _ = writer.close().await;
            return Err(ServerError::ConnectionLimit { max });
        };

        let (protocol, leftover) = match negotiate(&mut reader, &mut writer, self.config()).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let _ = writer.close().await;
                return Err(e);
            }
        };

        let (connection, writer_task) = Connection::spawn(
            ConnectionId::generate(),
            hub.path.clone(),
            protocol,
            identity,
            writer,
            &self.connection_options(),
        );
        hub.backend.on_connected(&connection).await;
        connection.mark_connected();
        info!(
            connection_id = %connection.id(),
            hub = %hub.path,
            protocol = %protocol,
            identity = %connection.identity(),
            "Client connected"
        );
        hub.run_hook(hub.methods.connected_hook(), &connection).await;

        let mut buffer =
            FrameBuffer::with_max_message_size(protocol, self.config().max_message_size);
        buffer.push(&leftover);
        let reason = self
            .read_loop(&hub, &connection, &mut reader, &mut buffer)
            .await;

        connection.close(reason);
        hub.backend.on_disconnected(&connection).await;
        hub.run_hook(hub.methods.disconnected_hook(), &connection).await;
        if let Err(e) = writer_task.await {
            warn!(connection_id = %connection.id(), error = %e, "Connection writer task failed");
        }
        info!(
            connection_id = %connection.id(),
            hub = %hub.path,
            reason = %connection.close_reason().unwrap_or(CloseReason::Normal),
            "Client disconnected"
        );
        Ok(())
    }

    /// Authenticates and serves a client over a byte stream.
    pub async fn serve_stream<S>(&self, hub_path: &str, stream: S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let identity = self.authenticate(&HandshakeContext::new(hub_path)).await?;
        let (reader, writer) = split_stream(stream);
        self.serve_connection(hub_path, identity, reader, writer)
            .await
    }

    /// Reads until the client leaves, the connection is closed elsewhere, or
    /// the client falls silent for longer than the client timeout.
    async fn read_loop<R: TransportReader>(
        &self,
        hub: &Arc<HubRuntime>,
        connection: &Connection,
        reader: &mut R,
        buffer: &mut FrameBuffer,
    ) -> CloseReason {
        if let Some(reason) = self.drain(hub, connection, buffer) {
            return reason;
        }

        let keep_alive = self.config().keep_alive_interval;
        let client_timeout = self.config().client_timeout;
        let mut last_received = Instant::now();
        let mut next_ping = last_received + keep_alive;

        loop {
            tokio::select! {
                biased;
                _ = connection.closing() => {
                    return connection.close_reason().unwrap_or(CloseReason::Normal);
                }
                chunk = reader.recv() => match chunk {
                    Ok(Some(bytes)) => {
                        last_received = Instant::now();
                        next_ping = last_received + keep_alive;
                        buffer.push(&bytes);
                        if let Some(reason) = self.drain(hub, connection, buffer) {
                            return reason;
                        }
                    }
                    Ok(None) => return CloseReason::ClientClosed,
                    Err(e) => return CloseReason::TransportFailure(e.to_string()),
                },
                _ = tokio::time::sleep_until(last_received + client_timeout) => {
                    return CloseReason::Timeout;
                }
                _ = tokio::time::sleep_until(next_ping) => {
                    debug!(connection_id = %connection.id(), "Idle, sending ping");
                    if let Err(e) = connection.send(&HubMessage::Ping) {
                        warn!(connection_id = %connection.id(), error = %e, "Failed to send ping");
                    }
                    next_ping = Instant::now() + keep_alive;
                }
            }
        }
    }

    /// Dispatches every complete frame in `buffer`.
    fn drain(
        &self,
        hub: &Arc<HubRuntime>,
        connection: &Connection,
        buffer: &mut FrameBuffer,
    ) -> Option<CloseReason> {
        loop {
            if connection.is_closing() {
                return Some(connection.close_reason().unwrap_or(CloseReason::Normal));
            }
            match buffer.next_message() {
                Ok(Some(message)) => self.dispatch_to(hub, connection, message),
                Ok(None) => return None,
                Err(e) => {
                    warn!(connection_id = %connection.id(), error = %e, "Malformed frame");
                    return Some(CloseReason::ProtocolError(e.to_string()));
                }
            }
        }
    }
}
