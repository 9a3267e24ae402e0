//! Hub protocol: message vocabulary, handshake and frame codecs.
//!
//! A connection starts with a JSON handshake naming one of the supported
//! protocols, after which every frame carries exactly one [`HubMessage`]:
//!
//! - `json`: a JSON object terminated by the ASCII record separator `0x1E`
//! - `messagepack`: a base-128 varint length followed by a MessagePack array
//!
//! Both codecs express the same vocabulary (Invocation, StreamItem,
//! Completion, CancelInvocation, Ping, Close) over [`HubValue`] arguments,
//! and decode resumably: feeding partial reads into a [`FrameBuffer`] yields
//! messages once whole frames have arrived.
//!
//! # Example
//!
//! ```rust
//! use hubwire_protocol::{FrameBuffer, HubMessage, HubProtocol, Invocation};
//! use serde_json::json;
//!
//! let protocol = HubProtocol::MessagePack;
//! let message = HubMessage::Invocation(Invocation::new("1", "Echo", vec![json!("hi")]));
//! let bytes = protocol.encode(&message).unwrap();
//!
//! let mut buffer = FrameBuffer::new(protocol);
//! buffer.push(&bytes[..3]);
//! assert!(buffer.next_message().unwrap().is_none());
//! buffer.push(&bytes[3..]);
//! assert_eq!(buffer.next_message().unwrap(), Some(message));
//! ```

mod buffer;
mod error;
mod framing;
mod handshake;
mod json;
mod message;
mod msgpack;
mod value;

pub use buffer::FrameBuffer;
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{decode_frame, encode_frame, read_frame, write_frame};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, RECORD_SEPARATOR, encode_handshake_request,
    encode_handshake_response, parse_handshake_request, parse_handshake_response,
};
pub use json::JsonCodec;
pub use message::{Close, Completion, CompletionOutcome, HubMessage, Invocation, StreamItem};
pub use msgpack::MessagePackCodec;
pub use value::HubValue;

/// Version of the hub protocol spoken after the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted by default (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A frame codec: converts between wire bytes and [`HubMessage`]s.
pub trait HubCodec {
    /// Encodes one message as a complete frame.
    fn encode(&self, message: &HubMessage) -> ProtocolResult<Vec<u8>>;

    /// Decodes the first frame in `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame, otherwise
    /// the message and the number of bytes it consumed.
    fn decode(&self, buf: &[u8]) -> ProtocolResult<Option<(HubMessage, usize)>>;
}

/// The protocols a client may select during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubProtocol {
    Json,
    MessagePack,
}

impl HubProtocol {
    pub const ALL: [HubProtocol; 2] = [HubProtocol::Json, HubProtocol::MessagePack];

    /// The name used in the handshake.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "messagepack",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Whether frames should travel as binary (rather than text) transport messages.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::MessagePack)
    }

    /// Encodes with the default size limit.
    pub fn encode(&self, message: &HubMessage) -> ProtocolResult<Vec<u8>> {
        self.codec(MAX_MESSAGE_SIZE).encode(message)
    }

    /// Decodes with the default size limit.
    pub fn decode(&self, buf: &[u8]) -> ProtocolResult<Option<(HubMessage, usize)>> {
        self.codec(MAX_MESSAGE_SIZE).decode(buf)
    }

    /// Returns the codec for this protocol with the given frame size limit.
    pub fn codec(&self, max_message_size: usize) -> Box<dyn HubCodec + Send + Sync> {
        match self {
            Self::Json => Box::new(JsonCodec::new(max_message_size)),
            Self::MessagePack => Box::new(MessagePackCodec::new(max_message_size)),
        }
    }
}

impl std::fmt::Display for HubProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
