//! Authentication and protocol negotiation for a new connection.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, warn};

use hubwire_core::IdentityToken;
use hubwire_protocol::{
    HandshakeResponse, HubProtocol, ProtocolError, encode_handshake_response,
    parse_handshake_request,
};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::hub::BoxFuture;
use crate::transport::{TransportReader, TransportWriter};

/// What an [`Authenticator`] can see of a connection attempt.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    pub hub_path: String,
    pub remote_addr: Option<SocketAddr>,
    /// Request headers, names lower-cased.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl HandshakeContext {
    pub fn new(hub_path: impl Into<String>) -> Self {
        Self {
            hub_path: hub_path.into(),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The bearer token from the `Authorization` header or the
    /// `access_token` query parameter.
    pub fn access_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .or_else(|| self.query.get("access_token").map(String::as_str))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// Turns a connection attempt into an identity, or rejects it.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        context: &'a HandshakeContext,
    ) -> BoxFuture<'a, ServerResult<IdentityToken>>;
}

/// Accepts everyone as [`IdentityToken::anonymous`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticator;

impl Authenticator for AnonymousAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _context: &'a HandshakeContext,
    ) -> BoxFuture<'a, ServerResult<IdentityToken>> {
        Box::pin(async { Ok(IdentityToken::anonymous()) })
    }
}

/// Maps fixed access tokens to identities.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, IdentityToken>,
    allow_anonymous: bool,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: accept `token` as `identity`.
    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens
            .insert(token.into(), IdentityToken::new(identity));
        self
    }

    /// Builder: let clients without a token in as anonymous.
    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate<'a>(
        &'a self,
        context: &'a HandshakeContext,
    ) -> BoxFuture<'a, ServerResult<IdentityToken>> {
        Box::pin(async move {
            match context.access_token() {
                Some(token) => self
                    .tokens
                    .get(token)
                    .cloned()
                    .ok_or_else(|| ServerError::unauthorized("invalid access token")),
                None if self.allow_anonymous => Ok(IdentityToken::anonymous()),
                None => Err(ServerError::unauthorized("access token required")),
            }
        })
    }
}

/// Runs the server side of the handshake.
///
/// Returns the negotiated protocol and any bytes the client sent after the
/// handshake record. On failure an error response is written before the
/// error is returned; the caller closes the transport.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &ServerConfig,
) -> ServerResult<(HubProtocol, Vec<u8>)>
where
    R: TransportReader,
    W: TransportWriter,
{
    let outcome =
        match tokio::time::timeout(config.handshake_timeout, read_request(reader, config)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::timeout("handshake")),
        };

    match outcome {
        Ok((protocol, leftover)) => {
            let response = encode_handshake_response(&HandshakeResponse::accepted())?;
            writer.send(response).await?;
            debug!(protocol = %protocol, "Handshake accepted");
            Ok((protocol, leftover))
        }
        Err(e) => {
            warn!(error = %e, "Handshake rejected");
            if let Ok(response) =
                encode_handshake_response(&HandshakeResponse::rejected(e.to_string()))
            {
                let _ = writer.send(response).await;
            }
            Err(e.into())
        }
    }
}

async fn read_request<R: TransportReader>(
    reader: &mut R,
    config: &ServerConfig,
) -> Result<(HubProtocol, Vec<u8>), ProtocolError> {
    let mut buf = Vec::new();
    loop {
        if let Some((request, used)) = parse_handshake_request(&buf, config.max_message_size)? {
            let protocol = request.negotiate()?;
            return Ok((protocol, buf.split_off(used)));
        }
        match reader.recv().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => {
                return Err(ProtocolError::handshake(
                    "connection closed before the handshake completed",
                ));
            }
        }
    }
}
