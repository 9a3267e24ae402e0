//! Binary configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/hubwire/config.toml` by default. Every key is optional; a
//! missing file yields the defaults.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:5000"
//! keep_alive_secs = 15
//!
//! [relay]
//! broker = "10.0.0.5:5100"
//!
//! [auth.tokens]
//! s3cret = "alice"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hubwire_core::LogFormat;
use hubwire_protocol::MAX_MESSAGE_SIZE;
use hubwire_server::{Authenticator, DEFAULT_LISTEN_ADDR, ServerConfig, StaticTokenAuthenticator};

use crate::error::{CliError, CliResult};

/// Default address the relay broker binds to.
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:5100";

// ---------------------------------------------------------------------------
// HubwireConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the hubwire binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubwireConfig {
    /// Debug mode.
    pub debug: bool,

    /// Log output settings.
    pub log: LogSettings,

    /// Hub server settings.
    pub server: ServerSettings,

    /// Cross-instance relay settings.
    pub relay: RelaySettings,

    /// Access token settings.
    pub auth: AuthSettings,
}

/// Log output settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub format: LogFormat,

    /// Filter directive such as `hubwire_server=trace`, overrides `RUST_LOG`.
    pub directive: Option<String>,
}

/// Hub server settings, mapped onto [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub max_connections: usize,
    pub keep_alive_secs: u64,
    pub client_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub close_flush_timeout_secs: u64,
    pub outbound_capacity: usize,
    pub max_message_size: usize,
    pub detailed_errors: bool,

    /// Keep groups after their last member leaves.
    pub persistent_groups: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_connections: defaults.max_connections,
            keep_alive_secs: defaults.keep_alive_interval.as_secs(),
            client_timeout_secs: defaults.client_timeout.as_secs(),
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            close_flush_timeout_secs: defaults.close_flush_timeout.as_secs(),
            outbound_capacity: defaults.outbound_capacity,
            max_message_size: MAX_MESSAGE_SIZE,
            detailed_errors: false,
            persistent_groups: false,
        }
    }
}

/// Relay settings, used by both `serve` and `relay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Broker address for `serve`. Without one the server runs standalone.
    pub broker: Option<String>,

    /// Stable instance identifier; generated at startup when unset.
    pub instance_id: Option<String>,

    /// Address the `relay` command binds to.
    pub listen_addr: String,

    /// Maximum number of server instances attached to the broker.
    pub max_peers: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            broker: None,
            instance_id: None,
            listen_addr: DEFAULT_BROKER_ADDR.to_string(),
            max_peers: 64,
        }
    }
}

/// Access token settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Access token to identity. Empty means every client is anonymous.
    pub tokens: BTreeMap<String, String>,

    /// Accept clients without a token when tokens are configured.
    pub allow_anonymous: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            tokens: BTreeMap::new(),
            allow_anonymous: true,
        }
    }
}

impl HubwireConfig {
    /// Loads configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            CliError::config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hubwire")
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> CliResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CliError::config(format!("failed to serialize config: {}", e)))
    }

    /// Builds and validates the server configuration.
    pub fn to_server_config(&self) -> CliResult<ServerConfig> {
        let server = &self.server;
        let listen_addr: SocketAddr = server.listen_addr.parse().map_err(|e| {
            CliError::config(format!("invalid listen_addr '{}': {}", server.listen_addr, e))
        })?;

        let config = ServerConfig::new(listen_addr)
            .with_max_connections(server.max_connections)
            .with_keep_alive(
                Duration::from_secs(server.keep_alive_secs),
                Duration::from_secs(server.client_timeout_secs),
            )
            .with_handshake_timeout(Duration::from_secs(server.handshake_timeout_secs))
            .with_close_flush_timeout(Duration::from_secs(server.close_flush_timeout_secs))
            .with_outbound_capacity(server.outbound_capacity)
            .with_max_message_size(server.max_message_size)
            .with_detailed_errors(server.detailed_errors)
            .with_persistent_groups(server.persistent_groups);
        config.validate()?;
        Ok(config)
    }

    /// Address the relay broker binds to.
    pub fn broker_listen_addr(&self) -> CliResult<SocketAddr> {
        self.relay.listen_addr.parse().map_err(|e| {
            CliError::config(format!(
                "invalid relay listen_addr '{}': {}",
                self.relay.listen_addr, e
            ))
        })
    }

    /// Token authenticator, or `None` when no tokens are configured.
    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        if self.auth.tokens.is_empty() {
            return None;
        }
        let authenticator = self.auth.tokens.iter().fold(
            StaticTokenAuthenticator::new().with_anonymous(self.auth.allow_anonymous),
            |auth, (token, identity)| auth.with_token(token, identity),
        );
        Some(Arc::new(authenticator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubwire_server::HandshakeContext;

    #[test]
    fn empty_file_yields_defaults() {
        let config: HubwireConfig = toml::from_str("").unwrap();
        assert_eq!(config, HubwireConfig::default());

        let server = config.to_server_config().unwrap();
        assert_eq!(server.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(server.keep_alive_interval, Duration::from_secs(15));
        assert_eq!(server.client_timeout, Duration::from_secs(30));
        assert!(server.reap_empty_groups);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
debug = true

[log]
format = "json"

[server]
listen_addr = "0.0.0.0:8080"
keep_alive_secs = 5
client_timeout_secs = 20
detailed_errors = true
persistent_groups = true

[relay]
broker = "10.0.0.5:5100"
instance_id = "edge-1"
"#,
        )
        .unwrap();

        let config = HubwireConfig::load_from(&path).unwrap();
        assert!(config.debug);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.relay.broker.as_deref(), Some("10.0.0.5:5100"));
        assert_eq!(config.relay.instance_id.as_deref(), Some("edge-1"));
        assert_eq!(config.relay.listen_addr, DEFAULT_BROKER_ADDR);

        let server = config.to_server_config().unwrap();
        assert_eq!(server.listen_addr.port(), 8080);
        assert_eq!(server.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(server.client_timeout, Duration::from_secs(20));
        assert!(server.detailed_errors);
        assert!(!server.reap_empty_groups);
    }

    #[test]
    fn load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = HubwireConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, CliError::Config(msg) if msg.contains("failed to read")));
    }

    #[test]
    fn invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nlisten_addr = 1").unwrap();
        let err = HubwireConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, CliError::Config(msg) if msg.contains("failed to parse")));
    }

    #[test]
    fn invalid_listen_addr_errors() {
        let mut config = HubwireConfig::default();
        config.server.listen_addr = "not an address".into();
        assert!(config.to_server_config().is_err());
    }

    #[test]
    fn timeout_shorter_than_keepalive_is_rejected() {
        let mut config = HubwireConfig::default();
        config.server.keep_alive_secs = 30;
        config.server.client_timeout_secs = 10;
        let err = config.to_server_config().unwrap_err();
        assert!(err.to_string().contains("client_timeout"));
    }

    #[test]
    fn toml_round_trip_keeps_settings() {
        let mut config = HubwireConfig::default();
        config.relay.broker = Some("relay:5100".into());
        config.auth.tokens.insert("s3cret".into(), "alice".into());

        let rendered = config.to_toml().unwrap();
        let parsed: HubwireConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn default_path_ends_with_config_toml() {
        let path = HubwireConfig::default_path();
        assert!(path.ends_with("hubwire/config.toml"));
    }

    #[tokio::test]
    async fn authenticator_from_tokens() {
        assert!(HubwireConfig::default().authenticator().is_none());

        let mut config = HubwireConfig::default();
        config.auth.tokens.insert("s3cret".into(), "alice".into());
        config.auth.allow_anonymous = false;
        let auth = config.authenticator().unwrap();

        let mut ctx = HandshakeContext::new("/test");
        assert!(auth.authenticate(&ctx).await.is_err());

        ctx.query.insert("access_token".into(), "s3cret".into());
        let identity = auth.authenticate(&ctx).await.unwrap();
        assert_eq!(identity.as_str(), "alice");
    }
}
