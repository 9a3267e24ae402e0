//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while negotiating, framing, encoding or decoding messages.
///
/// Any of these on an inbound frame is fatal for the owning connection only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// JSON (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// MessagePack encoding failed.
    #[error("messagepack encoding failed: {0}")]
    MessagePackEncode(String),

    /// MessagePack decoding failed.
    #[error("messagepack decoding failed: {0}")]
    MessagePackDecode(#[from] rmpv::decode::Error),

    /// A relay frame could not be serialized.
    #[error("frame encoding failed: {0}")]
    FrameEncode(#[from] rmp_serde::encode::Error),

    /// A relay frame could not be deserialized.
    #[error("frame decoding failed: {0}")]
    FrameDecode(#[from] rmp_serde::decode::Error),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream ended in the middle of a frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Zero-length frame.
    #[error("empty message")]
    EmptyMessage,

    /// Frame decoded but does not describe a valid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Frame carries a message type number outside the vocabulary.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    /// Varint length prefix is longer than 5 bytes or overflows.
    #[error("invalid length prefix")]
    InvalidLengthPrefix,

    /// Handshake named a protocol this server does not speak.
    #[error("the protocol '{0}' is not supported")]
    UnsupportedProtocol(String),

    /// Handshake requested an unsupported protocol version.
    #[error("the server does not support version {version} of the '{protocol}' protocol")]
    UnsupportedVersion { protocol: String, version: u32 },

    /// Handshake frame is malformed or was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates an invalid message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// Creates a handshake error.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}
