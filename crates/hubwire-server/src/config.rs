//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use hubwire_protocol::MAX_MESSAGE_SIZE;

use crate::error::{ServerError, ServerResult};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent connections across all hubs.
    pub max_connections: usize,

    /// A Ping is sent when nothing has been received for this long.
    pub keep_alive_interval: Duration,

    /// The connection is closed when nothing has been received for this long.
    pub client_timeout: Duration,

    /// Time allowed for the client to complete the handshake.
    pub handshake_timeout: Duration,

    /// Frames buffered per connection before it is closed as a slow consumer.
    pub outbound_capacity: usize,

    /// Largest frame accepted or produced.
    pub max_message_size: usize,

    /// Send exception detail to clients instead of a generic message.
    pub detailed_errors: bool,

    /// Remove groups as soon as their last member leaves.
    pub reap_empty_groups: bool,

    /// Upper bound on flushing queued frames when a connection closes.
    pub close_flush_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_connections: 1024,
            keep_alive_interval: Duration::from_secs(15),
            client_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            outbound_capacity: 256,
            max_message_size: MAX_MESSAGE_SIZE,
            detailed_errors: false,
            reap_empty_groups: true,
            close_flush_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration listening on the given address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set keepalive interval and client timeout.
    pub fn with_keep_alive(mut self, interval: Duration, client_timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.client_timeout = client_timeout;
        self
    }

    /// Builder: set handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builder: set outbound queue capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Builder: set max message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Builder: send detailed errors to clients.
    pub fn with_detailed_errors(mut self, detailed: bool) -> Self {
        self.detailed_errors = detailed;
        self
    }

    /// Builder: keep empty groups instead of reaping them.
    pub fn with_persistent_groups(mut self, persistent: bool) -> Self {
        self.reap_empty_groups = !persistent;
        self
    }

    /// Builder: set close flush timeout.
    pub fn with_close_flush_timeout(mut self, timeout: Duration) -> Self {
        self.close_flush_timeout = timeout;
        self
    }

    /// Checks values that would make the server misbehave.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_connections == 0 {
            return Err(ServerError::config("max_connections must be greater than zero"));
        }
        if self.outbound_capacity == 0 {
            return Err(ServerError::config("outbound_capacity must be greater than zero"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ServerError::config(
                "keep_alive_interval must be greater than zero",
            ));
        }
        if self.client_timeout <= self.keep_alive_interval {
            return Err(ServerError::config(
                "client_timeout must be longer than keep_alive_interval",
            ));
        }
        if self.max_message_size == 0 {
            return Err(ServerError::config("max_message_size must be greater than zero"));
        }
        Ok(())
    }
}
