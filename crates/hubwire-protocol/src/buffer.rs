use crate::error::ProtocolResult;
use crate::{HubCodec, HubMessage, HubProtocol, MAX_MESSAGE_SIZE};

/// Accumulates transport reads and yields whole messages.
///
/// A frame split across several reads is held until its remainder arrives;
/// several frames in one read are returned one by one.
pub struct FrameBuffer {
    protocol: HubProtocol,
    codec: Box<dyn HubCodec + Send + Sync>,
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(protocol: HubProtocol) -> Self {
        Self::with_max_message_size(protocol, MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(protocol: HubProtocol, max_message_size: usize) -> Self {
        Self {
            protocol,
            codec: protocol.codec(max_message_size),
            buf: Vec::new(),
        }
    }

    pub fn protocol(&self) -> HubProtocol {
        self.protocol
    }

    /// Appends bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next complete message, if one is buffered.
    ///
    /// After an error the buffer content is unspecified and the connection
    /// should be closed.
    pub fn next_message(&mut self) -> ProtocolResult<Option<HubMessage>> {
        match self.codec.decode(&self.buf)? {
            Some((message, used)) => {
                self.buf.drain(..used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("protocol", &self.protocol)
            .field("buffered", &self.buf.len())
            .finish()
    }
}
