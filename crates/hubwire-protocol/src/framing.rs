//! Length-prefixed MessagePack framing for relay links.
//!
//! Relay envelopes travel between a hub instance and the broker with a
//! 4-byte big-endian length prefix followed by the payload, serialized with
//! named fields so binary hub values cross instances intact:
//!
//! ```text
//! +----------------+----------------------+
//! | length (4 BE)  |  MessagePack payload |
//! +----------------+----------------------+
//! ```

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

const PREFIX_LEN: usize = 4;

/// Encodes a value as one length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(value)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(PREFIX_LEN + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Decodes one complete length-prefixed frame.
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    if data.len() < PREFIX_LEN {
        return Err(ProtocolError::IncompleteMessage {
            expected: PREFIX_LEN,
            received: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    check_len(len)?;

    if data.len() < PREFIX_LEN + len {
        return Err(ProtocolError::IncompleteMessage {
            expected: PREFIX_LEN + len,
            received: data.len(),
        });
    }

    Ok(rmp_serde::from_slice(&data[PREFIX_LEN..PREFIX_LEN + len])?)
}

fn check_len(len: usize) -> ProtocolResult<()> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(())
}

/// Reads one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> ProtocolResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; PREFIX_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Writes one frame to an async stream and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode_frame(value)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Completion, HubMessage, HubValue, Invocation, StreamItem};
    use serde_json::json;

    #[test]
    fn prefix_matches_payload_length() {
        let bytes = encode_frame(&HubMessage::Ping).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);

        let decoded: HubMessage = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, HubMessage::Ping);
    }

    #[test]
    fn incomplete_frames() {
        let result: ProtocolResult<HubMessage> = decode_frame(&[0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage { expected: 4, .. })
        ));

        let mut data = vec![0, 0, 0, 100];
        data.extend_from_slice(&[0u8; 10]);
        let result: ProtocolResult<HubMessage> = decode_frame(&data);
        assert!(matches!(result, Err(ProtocolError::IncompleteMessage { .. })));
    }

    #[test]
    fn oversized_prefix() {
        let data = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let result: ProtocolResult<HubMessage> = decode_frame(&data);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn async_stream_roundtrip() {
        let messages = vec![
            HubMessage::Ping,
            HubMessage::Invocation(Invocation::new("1", "Echo", vec![json!("hi")])),
            HubMessage::StreamItem(StreamItem::new("2", HubValue::binary(vec![0xde, 0xad]))),
            HubMessage::Completion(Completion::result(
                "3",
                HubValue::from(rmpv::Value::F32(0.5)),
            )),
        ];

        let (mut client, mut server) = tokio::io::duplex(1024);
        for message in &messages {
            write_frame(&mut client, message).await.unwrap();
        }
        drop(client);

        for expected in &messages {
            let actual: HubMessage = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(&actual, expected);
        }
        let eof: Option<HubMessage> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn zero_length_frame_is_an_error() {
        let mut data: &[u8] = &[0, 0, 0, 0];
        let result: ProtocolResult<Option<HubMessage>> = read_frame(&mut data).await;
        assert!(matches!(result, Err(ProtocolError::EmptyMessage)));
    }
}
