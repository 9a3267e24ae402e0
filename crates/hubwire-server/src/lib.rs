//! Hub dispatch engine.
//!
//! This crate accepts persistent client connections, negotiates a frame
//! protocol, and routes invocations to registered hub methods:
//! - [`Connection`]: ordered outbound queue, lifecycle, keepalive
//! - [`GroupRegistry`]: named multicast groups per hub
//! - [`Dispatcher`]: method tables, invocation execution, streaming
//! - [`DeliveryBackend`]: local delivery or relay-backed fan-out across instances
//! - [`listener`]: axum WebSocket endpoint per hub
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hubwire_server::{Dispatcher, HubMethodTable, ParamKind, ServerConfig, SignalHandler, serve};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
//!
//!     let mut dispatcher = Dispatcher::new(config);
//!     dispatcher.register_hub(
//!         "/chat",
//!         HubMethodTable::new().method("Send", &[ParamKind::String], |ctx, args| async move {
//!             ctx.clients().all().send("Receive", args.into_values()).await;
//!             Ok(None)
//!         }),
//!     )?;
//!
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     serve(listener, Arc::new(dispatcher), signals.shutdown().wait()).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod context;
mod delivery;
mod dispatcher;
mod error;
mod groups;
mod hub;
pub mod listener;
mod negotiate;
pub mod relay;
mod session;
mod signals;
mod transport;

pub use config::{DEFAULT_LISTEN_ADDR, ServerConfig};
pub use connection::{CloseReason, Connection, ConnectionOptions, ConnectionState};
pub use context::{ClientProxy, GroupManager, HubClients, HubContext};
pub use delivery::{DeliveryBackend, LocalDelivery, Target};
pub use dispatcher::Dispatcher;
pub use error::{HubError, RelayError, RelayResult, ServerError, ServerResult};
pub use groups::GroupRegistry;
pub use hub::{
    Arguments, BoxFuture, ClientStream, ItemStream, LifecycleHook, MethodDescriptor,
    MethodResult, HubMethodTable, ParamKind,
};
pub use hubwire_protocol::HubValue;
pub use listener::{router, serve};
pub use negotiate::{
    AnonymousAuthenticator, Authenticator, HandshakeContext, StaticTokenAuthenticator, negotiate,
};
pub use relay::{
    Backoff, MemoryRelay, RelayBroker, RelayDelivery, RelayEnvelope, RelayEvent, RelayHealth,
    RelayTransport, TcpRelay, TcpRelayConfig,
};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use transport::{StreamReader, StreamWriter, TransportReader, TransportWriter, split_stream};
