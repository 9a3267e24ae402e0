//! The JSON handshake exchanged before any hub message.
//!
//! Both directions are a single JSON object terminated by [`RECORD_SEPARATOR`],
//! regardless of the protocol being negotiated:
//!
//! ```text
//! client: {"protocol":"messagepack","version":1}\x1e
//! server: {}\x1e                 accepted
//! server: {"error":"..."}\x1e    rejected, connection closes
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{HubProtocol, PROTOCOL_VERSION};

/// Terminates JSON frames and handshake records.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// The first record a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn new(protocol: HubProtocol) -> Self {
        Self {
            protocol: protocol.name().to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Resolves the requested protocol, rejecting unknown names and versions.
    pub fn negotiate(&self) -> ProtocolResult<HubProtocol> {
        let protocol = HubProtocol::from_name(&self.protocol)
            .ok_or_else(|| ProtocolError::UnsupportedProtocol(self.protocol.clone()))?;
        if self.version != protocol.version() {
            return Err(ProtocolError::UnsupportedVersion {
                protocol: self.protocol.clone(),
                version: self.version,
            });
        }
        Ok(protocol)
    }
}

/// The server's answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

fn encode_record<T: Serialize>(record: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(record)?;
    bytes.push(RECORD_SEPARATOR);
    Ok(bytes)
}

fn parse_record<T: serde::de::DeserializeOwned>(
    buf: &[u8],
    max_size: usize,
) -> ProtocolResult<Option<(T, usize)>> {
    let Some(end) = buf.iter().position(|b| *b == RECORD_SEPARATOR) else {
        if buf.len() > max_size {
            return Err(ProtocolError::MessageTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
        return Ok(None);
    };
    let record = serde_json::from_slice(&buf[..end])
        .map_err(|e| ProtocolError::handshake(format!("malformed handshake: {e}")))?;
    Ok(Some((record, end + 1)))
}

pub fn encode_handshake_request(request: &HandshakeRequest) -> ProtocolResult<Vec<u8>> {
    encode_record(request)
}

pub fn encode_handshake_response(response: &HandshakeResponse) -> ProtocolResult<Vec<u8>> {
    encode_record(response)
}

/// Parses a handshake request from the start of `buf`.
///
/// Returns the request and the number of bytes it occupied; anything after
/// that belongs to the negotiated protocol. `Ok(None)` means keep reading.
pub fn parse_handshake_request(
    buf: &[u8],
    max_size: usize,
) -> ProtocolResult<Option<(HandshakeRequest, usize)>> {
    parse_record(buf, max_size)
}

pub fn parse_handshake_response(
    buf: &[u8],
    max_size: usize,
) -> ProtocolResult<Option<(HandshakeResponse, usize)>> {
    parse_record(buf, max_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_trailing_frame() {
        let mut buf = br#"{"protocol":"json","version":1}"#.to_vec();
        buf.push(RECORD_SEPARATOR);
        buf.extend_from_slice(b"{\"type\":6}\x1e");

        let (request, used) = parse_handshake_request(&buf, 1024).unwrap().unwrap();
        assert_eq!(request.negotiate().unwrap(), HubProtocol::Json);
        assert_eq!(&buf[used..], b"{\"type\":6}\x1e");
    }

    #[test]
    fn partial_request_needs_more_data() {
        assert!(
            parse_handshake_request(br#"{"protocol":"js"#, 1024)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let request = HandshakeRequest {
            protocol: "protobuf".into(),
            version: 1,
        };
        let err = request.negotiate().unwrap_err();
        assert_eq!(err.to_string(), "the protocol 'protobuf' is not supported");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let request = HandshakeRequest {
            protocol: "messagepack".into(),
            version: 9,
        };
        assert!(matches!(
            request.negotiate(),
            Err(ProtocolError::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn malformed_request() {
        let err = parse_handshake_request(b"not json\x1e", 1024).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)));
    }

    #[test]
    fn oversized_request_without_terminator() {
        assert!(matches!(
            parse_handshake_request(&[b'a'; 32], 16),
            Err(ProtocolError::MessageTooLarge { size: 32, max: 16 })
        ));
    }

    #[test]
    fn response_encoding() {
        assert_eq!(
            encode_handshake_response(&HandshakeResponse::accepted()).unwrap(),
            b"{}\x1e"
        );
        assert_eq!(
            encode_handshake_response(&HandshakeResponse::rejected("nope")).unwrap(),
            b"{\"error\":\"nope\"}\x1e"
        );
        let request = encode_handshake_request(&HandshakeRequest::new(HubProtocol::MessagePack))
            .unwrap();
        assert_eq!(request, b"{\"protocol\":\"messagepack\",\"version\":1}\x1e");

        let (response, used) = parse_handshake_response(b"{}\x1e", 64).unwrap().unwrap();
        assert_eq!(response, HandshakeResponse::accepted());
        assert_eq!(used, 3);
    }
}
