//! Server error types.

use std::io;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (bind, accept, transport).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (handshake, framing, encoding).
    #[error("Protocol error: {0}")]
    Protocol(#[from] hubwire_protocol::ProtocolError),

    /// No hub is registered at the requested path.
    #[error("No hub registered at '{path}'")]
    UnknownHub { path: String },

    /// A hub is already registered at this path.
    #[error("A hub is already registered at '{path}'")]
    DuplicateHub { path: String },

    /// The authenticator rejected the connection.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Every connection slot is taken.
    #[error("Connection limit of {max} reached")]
    ConnectionLimit { max: usize },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Relay backend error.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unknown hub error.
    pub fn unknown_hub(path: impl Into<String>) -> Self {
        Self::UnknownHub { path: path.into() }
    }

    /// Creates an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }
}

/// Failure raised by hub method code or by argument binding.
///
/// Only [`HubError::InvalidArguments`] and [`HubError::Hub`] reach the client
/// verbatim; [`HubError::Internal`] detail is logged and replaced by a generic
/// message unless detailed errors are enabled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// Arguments do not match the method's declared parameters.
    #[error("{0}")]
    InvalidArguments(String),

    /// A message the hub method deliberately exposes to the caller.
    #[error("{0}")]
    Hub(String),

    /// Any other failure inside the method.
    #[error("{0}")]
    Internal(String),
}

impl HubError {
    /// Creates an invalid arguments error.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    /// Creates an error whose message is sent to the caller as-is.
    pub fn hub(message: impl Into<String>) -> Self {
        Self::Hub(message.into())
    }

    /// Creates an internal error; the message is only logged by default.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised by relay transports.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay cannot currently accept messages.
    #[error("relay unavailable: {reason}")]
    Unavailable { reason: String },

    /// IO error talking to the broker.
    #[error("relay IO error: {0}")]
    Io(#[from] io::Error),

    /// Envelope framing failed.
    #[error("relay protocol error: {0}")]
    Protocol(#[from] hubwire_protocol::ProtocolError),
}

impl RelayError {
    /// Creates an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}
