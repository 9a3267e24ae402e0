//! WebSocket listener exposing every registered hub.
//!
//! Each hub path becomes a `GET` route that authenticates the upgrade
//! request, then hands the socket to [`Dispatcher::serve_connection`].
//! JSON frames travel as text messages, MessagePack frames as binary ones.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, MatchedPath, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{ServerError, ServerResult};
use crate::negotiate::HandshakeContext;
use crate::transport::{TransportReader, TransportWriter};

/// Builds a router with one WebSocket route per registered hub.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let paths: Vec<String> = dispatcher
        .hub_paths()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut router = Router::new();
    for path in &paths {
        router = router.route(path, get(ws_upgrade));
    }
    router.with_state(dispatcher)
}

/// Serves the hubs on `listener` until `shutdown` completes.
///
/// On shutdown every connection is closed with
/// [`crate::CloseReason::ServerShutdown`] before the listener stops.
pub async fn serve<S>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: S,
) -> ServerResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, hubs = ?dispatcher.hub_paths(), "Hub listener started");

    let app = router(dispatcher.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down hub listener");
        dispatcher.shutdown().await;
    })
    .await?;

    info!("Hub listener stopped");
    Ok(())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
    matched: MatchedPath,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let context = HandshakeContext {
        hub_path: matched.as_str().to_string(),
        remote_addr: Some(remote_addr),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        query,
    };

    let identity = match dispatcher.authenticate(&context).await {
        Ok(identity) => identity,
        Err(e @ ServerError::Unauthorized { .. }) => {
            warn!(hub = %context.hub_path, remote = %remote_addr, error = %e, "Rejected connection attempt");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
        Err(e @ ServerError::UnknownHub { .. }) => {
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Err(e) => {
            warn!(hub = %context.hub_path, error = %e, "Authentication failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let hub_path = context.hub_path;
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reader = WsReader { stream };
        let writer = WsWriter {
            sink,
            binary: false,
        };
        if let Err(e) = dispatcher
            .serve_connection(&hub_path, identity, reader, writer)
            .await
        {
            debug!(hub = %hub_path, remote = %remote_addr, error = %e, "WebSocket session ended before connecting");
        }
    })
}

struct WsReader {
    stream: SplitStream<WebSocket>,
}

impl TransportReader for WsReader {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().as_bytes().to_vec())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Ping/Pong are answered by the WebSocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
    binary: bool,
}

impl TransportWriter for WsWriter {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        let message = if self.binary {
            Message::Binary(frame.into())
        } else {
            let text = String::from_utf8(frame).map_err(io::Error::other)?;
            Message::Text(text.into())
        };
        self.sink.send(message).await.map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await.map_err(io::Error::other)
    }

    fn set_binary(&mut self, binary: bool) {
        self.binary = binary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::hub::{HubMethodTable, ParamKind};
    use crate::negotiate::StaticTokenAuthenticator;
    use hubwire_protocol::{Close, Completion, HubMessage, HubProtocol};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite;

    fn echo_hub() -> HubMethodTable {
        HubMethodTable::new().method("Echo", &[ParamKind::Any], |_ctx, args| async move {
            Ok(args.value(0).cloned())
        })
    }

    async fn start(
        dispatcher: Dispatcher,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<ServerResult<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::new(dispatcher), async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, server)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(tungstenite::Message::Ping(_))) => {}
                other => panic!("unexpected websocket message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn websocket_echo_and_shutdown() {
        let mut dispatcher = Dispatcher::new(ServerConfig::default());
        dispatcher.register_hub("/echo", echo_hub()).unwrap();
        let (addr, stop, server) = start(dispatcher).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/echo"))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Text(
            "{\"protocol\":\"json\",\"version\":1}\u{1e}".into(),
        ))
        .await
        .unwrap();
        assert_eq!(next_text(&mut ws).await, "{}\u{1e}");

        ws.send(tungstenite::Message::Text(
            "{\"type\":1,\"invocationId\":\"1\",\"target\":\"Echo\",\"arguments\":[\"hi\"]}\u{1e}"
                .into(),
        ))
        .await
        .unwrap();
        let reply = next_text(&mut ws).await;
        let (message, _) = HubProtocol::Json.decode(reply.as_bytes()).unwrap().unwrap();
        assert_eq!(
            message,
            HubMessage::Completion(Completion::result("1", json!("hi")))
        );

        stop.send(()).unwrap();
        let close = next_text(&mut ws).await;
        let (message, _) = HubProtocol::Json.decode(close.as_bytes()).unwrap().unwrap();
        assert_eq!(
            message,
            HubMessage::Close(Close {
                error: None,
                allow_reconnect: true,
            })
        );
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unauthorized_upgrade_is_refused() {
        let auth = StaticTokenAuthenticator::new().with_token("secret", "alice");
        let mut dispatcher =
            Dispatcher::new(ServerConfig::default()).with_authenticator(Arc::new(auth));
        dispatcher.register_hub("/echo", echo_hub()).unwrap();
        let (addr, _stop, _server) = start(dispatcher).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/echo"))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, tungstenite::Error::Http(response) if response.status() == 401),
            "{err:?}"
        );

        let ok = tokio_tungstenite::connect_async(format!("ws://{addr}/echo?access_token=secret"))
            .await;
        assert!(ok.is_ok());
    }
}
