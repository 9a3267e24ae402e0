//! Binary protocol: varint length prefix followed by a MessagePack array.
//!
//! ```text
//! +---------------------+----------------------------------------+
//! | length (varint, ≤5) |  [type, {headers}, field, field, ...]  |
//! +---------------------+----------------------------------------+
//! ```
//!
//! Array layouts by type:
//!
//! | type | layout |
//! |---|---|
//! | 1 Invocation | `[1, {}, id \| nil, target, [args], [streamIds]]` |
//! | 2 StreamItem | `[2, {}, id, item]` |
//! | 3 Completion | `[3, {}, id, 1, error]`, `[3, {}, id, 2]`, `[3, {}, id, 3, result]` |
//! | 4 StreamInvocation | `[4, {}, id, target, [args], [streamIds]]` |
//! | 5 CancelInvocation | `[5, {}, id]` |
//! | 6 Ping | `[6]` |
//! | 7 Close | `[7, error \| nil, allowReconnect]` |

use rmpv::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Close, Completion, CompletionOutcome, HubMessage, Invocation, StreamItem, kind};
use crate::value::HubValue;
use crate::{HubCodec, MAX_MESSAGE_SIZE};

const RESULT_ERROR: u64 = 1;
const RESULT_VOID: u64 = 2;
const RESULT_VALUE: u64 = 3;

/// Longest varint accepted for a frame length.
const MAX_PREFIX_LEN: usize = 5;

/// The `messagepack` hub protocol.
///
/// Payloads are read into [`rmpv::Value`] rather than a serde data model, so
/// float32, `bin` and `ext` values are carried as sent.
#[derive(Debug, Clone)]
pub struct MessagePackCodec {
    max_message_size: usize,
}

impl Default for MessagePackCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().map(|v| Value::from(v.as_str())).collect())
}

fn optional_string(value: Option<&str>) -> Value {
    value.map_or(Value::Nil, Value::from)
}

impl MessagePackCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    fn to_value(message: &HubMessage) -> Value {
        let headers = Value::Map(Vec::new());
        let fields = match message {
            HubMessage::Invocation(inv) => {
                let ty = if inv.streaming {
                    kind::STREAM_INVOCATION
                } else {
                    kind::INVOCATION
                };
                vec![
                    Value::from(ty),
                    headers,
                    optional_string(inv.invocation_id.as_deref()),
                    Value::from(inv.target.as_str()),
                    Value::Array(
                        inv.arguments
                            .iter()
                            .map(|arg| arg.as_msgpack().clone())
                            .collect(),
                    ),
                    string_array(&inv.stream_ids),
                ]
            }
            HubMessage::StreamItem(item) => vec![
                Value::from(kind::STREAM_ITEM),
                headers,
                Value::from(item.invocation_id.as_str()),
                item.item.as_msgpack().clone(),
            ],
            HubMessage::Completion(completion) => {
                let mut fields = vec![
                    Value::from(kind::COMPLETION),
                    headers,
                    Value::from(completion.invocation_id.as_str()),
                ];
                match &completion.outcome {
                    CompletionOutcome::Error(error) => {
                        fields.push(Value::from(RESULT_ERROR));
                        fields.push(Value::from(error.as_str()));
                    }
                    CompletionOutcome::Void => fields.push(Value::from(RESULT_VOID)),
                    CompletionOutcome::Result(value) => {
                        fields.push(Value::from(RESULT_VALUE));
                        fields.push(value.as_msgpack().clone());
                    }
                }
                fields
            }
            HubMessage::CancelInvocation { invocation_id } => vec![
                Value::from(kind::CANCEL_INVOCATION),
                headers,
                Value::from(invocation_id.as_str()),
            ],
            HubMessage::Ping => vec![Value::from(kind::PING)],
            HubMessage::Close(close) => vec![
                Value::from(kind::CLOSE),
                optional_string(close.error.as_deref()),
                Value::Boolean(close.allow_reconnect),
            ],
        };
        Value::Array(fields)
    }

    fn from_value(value: Value) -> ProtocolResult<HubMessage> {
        let Value::Array(fields) = value else {
            return Err(ProtocolError::invalid("frame is not a MessagePack array"));
        };
        let mut fields = Fields::new(fields);

        let ty = fields.u64("type")?;
        let message = match ty {
            kind::INVOCATION | kind::STREAM_INVOCATION => {
                fields.skip_headers()?;
                let invocation_id = fields.optional_string("invocationId")?;
                let streaming = ty == kind::STREAM_INVOCATION;
                if streaming && invocation_id.is_none() {
                    return Err(ProtocolError::invalid(
                        "stream invocation requires an invocation id",
                    ));
                }
                let target = fields.string("target")?;
                let arguments = fields
                    .array("arguments")?
                    .into_iter()
                    .map(HubValue::from)
                    .collect();
                let stream_ids = match fields.next_optional() {
                    None | Some(Value::Nil) => Vec::new(),
                    Some(Value::Array(ids)) => ids
                        .into_iter()
                        .map(|id| match id {
                            Value::String(s) => s.into_str(),
                            _ => None,
                        })
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| ProtocolError::invalid("stream ids must be strings"))?,
                    Some(_) => return Err(ProtocolError::invalid("stream ids must be an array")),
                };
                HubMessage::Invocation(Invocation {
                    invocation_id,
                    target,
                    arguments,
                    streaming,
                    stream_ids,
                })
            }
            kind::STREAM_ITEM => {
                fields.skip_headers()?;
                let invocation_id = fields.string("invocationId")?;
                let item = HubValue::from(fields.value("item")?);
                HubMessage::StreamItem(StreamItem {
                    invocation_id,
                    item,
                })
            }
            kind::COMPLETION => {
                fields.skip_headers()?;
                let invocation_id = fields.string("invocationId")?;
                let outcome = match fields.u64("resultKind")? {
                    RESULT_ERROR => CompletionOutcome::Error(fields.string("error")?),
                    RESULT_VOID => CompletionOutcome::Void,
                    RESULT_VALUE => CompletionOutcome::Result(HubValue::from(fields.value("result")?)),
                    other => {
                        return Err(ProtocolError::invalid(format!(
                            "invalid completion result kind {other}"
                        )));
                    }
                };
                HubMessage::Completion(Completion {
                    invocation_id,
                    outcome,
                })
            }
            kind::CANCEL_INVOCATION => {
                fields.skip_headers()?;
                HubMessage::CancelInvocation {
                    invocation_id: fields.string("invocationId")?,
                }
            }
            kind::PING => HubMessage::Ping,
            kind::CLOSE => {
                let error = fields.optional_string("error")?;
                let allow_reconnect = fields
                    .next_optional()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                HubMessage::Close(Close {
                    error,
                    allow_reconnect,
                })
            }
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

/// Positional reader over a decoded message array.
struct Fields {
    inner: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(fields: Vec<Value>) -> Self {
        Self {
            inner: fields.into_iter(),
        }
    }

    fn next_optional(&mut self) -> Option<Value> {
        self.inner.next()
    }

    fn value(&mut self, name: &str) -> ProtocolResult<Value> {
        self.inner
            .next()
            .ok_or_else(|| ProtocolError::invalid(format!("missing field '{name}'")))
    }

    fn u64(&mut self, name: &str) -> ProtocolResult<u64> {
        self.value(name)?
            .as_u64()
            .ok_or_else(|| ProtocolError::invalid(format!("'{name}' must be an integer")))
    }

    fn string(&mut self, name: &str) -> ProtocolResult<String> {
        self.optional_string(name)?
            .ok_or_else(|| ProtocolError::invalid(format!("'{name}' must not be nil")))
    }

    fn optional_string(&mut self, name: &str) -> ProtocolResult<Option<String>> {
        match self.value(name)? {
            Value::Nil => Ok(None),
            Value::String(s) => s
                .into_str()
                .map(Some)
                .ok_or_else(|| ProtocolError::invalid(format!("'{name}' must be valid UTF-8"))),
            _ => Err(ProtocolError::invalid(format!("'{name}' must be a string"))),
        }
    }

    fn array(&mut self, name: &str) -> ProtocolResult<Vec<Value>> {
        match self.value(name)? {
            Value::Array(values) => Ok(values),
            _ => Err(ProtocolError::invalid(format!("'{name}' must be an array"))),
        }
    }

    fn skip_headers(&mut self) -> ProtocolResult<()> {
        match self.value("headers")? {
            Value::Map(_) | Value::Nil => Ok(()),
            _ => Err(ProtocolError::invalid("'headers' must be a map")),
        }
    }
}

/// Writes `len` as a base-128 varint.
fn write_length_prefix(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Reads a varint length; `Ok(None)` when more bytes are needed.
fn read_length_prefix(buf: &[u8]) -> ProtocolResult<Option<(usize, usize)>> {
    let mut len: usize = 0;
    for (i, byte) in buf.iter().take(MAX_PREFIX_LEN).enumerate() {
        len |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            if i == MAX_PREFIX_LEN - 1 && *byte > 0x0f {
                // The fifth byte only carries the top 4 bits of a u32.
                return Err(ProtocolError::InvalidLengthPrefix);
            }
            return Ok(Some((len, i + 1)));
        }
    }
    if buf.len() >= MAX_PREFIX_LEN {
        return Err(ProtocolError::InvalidLengthPrefix);
    }
    Ok(None)
}

impl HubCodec for MessagePackCodec {
    fn encode(&self, message: &HubMessage) -> ProtocolResult<Vec<u8>> {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Self::to_value(message))
            .map_err(|e| ProtocolError::MessagePackEncode(e.to_string()))?;
        if payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }
        let mut frame = Vec::with_capacity(payload.len() + MAX_PREFIX_LEN);
        write_length_prefix(payload.len(), &mut frame);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode(&self, buf: &[u8]) -> ProtocolResult<Option<(HubMessage, usize)>> {
        let Some((len, prefix_len)) = read_length_prefix(buf)? else {
            return Ok(None);
        };
        if len == 0 {
            return Err(ProtocolError::EmptyMessage);
        }
        if len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        let end = prefix_len + len;
        if buf.len() < end {
            return Ok(None);
        }

        let mut payload = &buf[prefix_len..end];
        let value = rmpv::decode::read_value(&mut payload)?;
        if !payload.is_empty() {
            return Err(ProtocolError::invalid(format!(
                "{} trailing bytes after the message",
                payload.len()
            )));
        }
        Ok(Some((Self::from_value(value)?, end)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> MessagePackCodec {
        MessagePackCodec::default()
    }

    /// Prefixes a hand-built MessagePack payload with its length.
    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        write_length_prefix(payload.len(), &mut frame);
        frame.extend_from_slice(payload);
        frame
    }

    fn decode_one(bytes: &[u8]) -> HubMessage {
        let (message, used) = codec().decode(bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        message
    }

    #[test]
    fn varint_prefix_roundtrip() {
        for len in [0usize, 1, 127, 128, 300, 16_383, 16_384, 1 << 21, u32::MAX as usize] {
            let mut buf = Vec::new();
            write_length_prefix(len, &mut buf);
            assert_eq!(read_length_prefix(&buf).unwrap(), Some((len, buf.len())));
        }
    }

    #[test]
    fn varint_prefix_needs_more_data() {
        assert_eq!(read_length_prefix(&[]).unwrap(), None);
        assert_eq!(read_length_prefix(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn varint_prefix_too_long() {
        assert!(matches!(
            read_length_prefix(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(ProtocolError::InvalidLengthPrefix)
        ));
        assert!(matches!(
            read_length_prefix(&[0xff, 0xff, 0xff, 0xff, 0x10]),
            Err(ProtocolError::InvalidLengthPrefix)
        ));
    }

    #[test]
    fn ping_wire_format() {
        // length 2, fixarray(1), positive fixint 6
        assert_eq!(codec().encode(&HubMessage::Ping).unwrap(), vec![0x02, 0x91, 0x06]);
    }

    #[test]
    fn void_completion_wire_format() {
        let bytes = codec()
            .encode(&HubMessage::Completion(Completion::void("1")))
            .unwrap();
        // fixarray(4) [3, fixmap(0), "1", 2]
        assert_eq!(bytes, vec![0x06, 0x94, 0x03, 0x80, 0xa1, b'1', 0x02]);
    }

    #[test]
    fn float32_argument_keeps_its_width() {
        // [1, {}, "1", "Echo", [f32 1.5], []]
        let bytes = frame(&[
            0x96, 0x01, 0x80, 0xa1, b'1', 0xa4, b'E', b'c', b'h', b'o', 0x91, 0xca, 0x3f, 0xc0,
            0x00, 0x00, 0x90,
        ]);
        assert_eq!(bytes[0], 17);

        let HubMessage::Invocation(inv) = decode_one(&bytes) else {
            panic!("expected an invocation");
        };
        assert_eq!(inv.arguments[0].as_msgpack(), &Value::F32(1.5));
        assert_eq!(inv.arguments[0].as_f64(), Some(1.5));
        assert_eq!(
            codec().encode(&HubMessage::Invocation(inv)).unwrap(),
            bytes
        );
    }

    #[test]
    fn binary_argument_is_accepted() {
        // [1, {}, "1", "Echo", [bin8 "ab"], []]
        let bytes = frame(&[
            0x96, 0x01, 0x80, 0xa1, b'1', 0xa4, b'E', b'c', b'h', b'o', 0x91, 0xc4, 0x02, b'a',
            b'b', 0x90,
        ]);
        let message = decode_one(&bytes);
        let HubMessage::Invocation(inv) = &message else {
            panic!("expected an invocation");
        };
        assert!(inv.arguments[0].is_binary());
        assert_eq!(inv.arguments[0].to_bytes(), Some(b"ab".to_vec()));
        assert_eq!(codec().encode(&message).unwrap(), bytes);
    }

    #[test]
    fn reencoding_foreign_frames_reproduces_bytes() {
        let payloads: Vec<Vec<u8>> = vec![
            // [4, {}, "s", "Count", [10], ["0"]]
            vec![
                0x96, 0x04, 0x80, 0xa1, b's', 0xa5, b'C', b'o', b'u', b'n', b't', 0x91, 0x0a,
                0x91, 0xa1, b'0',
            ],
            // [2, {}, "1", f64 2.5]
            vec![
                0x94, 0x02, 0x80, 0xa1, b'1', 0xcb, 0x40, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00,
            ],
            // [2, {}, "1", [-1, uint16 300, nil, true]]
            vec![
                0x94, 0x02, 0x80, 0xa1, b'1', 0x94, 0xff, 0xcd, 0x01, 0x2c, 0xc0, 0xc3,
            ],
            // [3, {}, "1", 1, "boom"]
            vec![0x95, 0x03, 0x80, 0xa1, b'1', 0x01, 0xa4, b'b', b'o', b'o', b'm'],
            // [3, {}, "1", 2]
            vec![0x94, 0x03, 0x80, 0xa1, b'1', 0x02],
            // [3, {}, "1", 3, {1: fixext1(5, 0xff)}]
            vec![
                0x95, 0x03, 0x80, 0xa1, b'1', 0x03, 0x81, 0x01, 0xd4, 0x05, 0xff,
            ],
            // [5, {}, "7"]
            vec![0x93, 0x05, 0x80, 0xa1, b'7'],
            // [6]
            vec![0x91, 0x06],
            // [7, "bye", true]
            vec![0x93, 0x07, 0xa3, b'b', b'y', b'e', 0xc3],
            // [7, nil, false]
            vec![0x93, 0x07, 0xc0, 0xc2],
        ];
        let mut kinds = Vec::new();
        for payload in payloads {
            let bytes = frame(&payload);
            let message = decode_one(&bytes);
            kinds.push(message.kind_name());
            assert_eq!(codec().encode(&message).unwrap(), bytes, "{message:?}");
        }
        insta::assert_snapshot!(kinds.join(","), @"stream_invocation,stream_item,stream_item,completion,completion,completion,cancel_invocation,ping,close,close");
    }

    #[test]
    fn completion_kinds_decode_to_outcomes() {
        let error = decode_one(&frame(&[0x95, 0x03, 0x80, 0xa1, b'1', 0x01, 0xa2, b'n', b'o']));
        assert_eq!(error, HubMessage::Completion(Completion::error("1", "no")));

        let void = decode_one(&frame(&[0x94, 0x03, 0x80, 0xa1, b'1', 0x02]));
        assert_eq!(void, HubMessage::Completion(Completion::void("1")));

        let result = decode_one(&frame(&[0x95, 0x03, 0x80, 0xa1, b'1', 0x03, 0x2a]));
        assert_eq!(result, HubMessage::Completion(Completion::result("1", json!(42))));

        assert!(matches!(
            codec().decode(&frame(&[0x95, 0x03, 0x80, 0xa1, b'1', 0x09, 0xc0])),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn invocation_roundtrip_preserves_argument_types() {
        let message = HubMessage::Invocation(Invocation::new(
            "12",
            "Invoke",
            vec![
                HubValue::from("Hello, World!"),
                HubValue::from(-5i64),
                HubValue::from(1.2),
                HubValue::from(true),
                HubValue::from(json!({"str": "x", "arr": [1, 2, 3]})),
                HubValue::NULL,
                HubValue::binary(vec![0u8, 1, 2]),
                HubValue::from(Value::F32(0.25)),
            ],
        ));
        let bytes = codec().encode(&message).unwrap();
        let decoded = decode_one(&bytes);
        assert_eq!(decoded, message);
        assert_eq!(codec().encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn upload_stream_ids_round_trip() {
        let message = HubMessage::Invocation(
            Invocation::new("1", "AddNumbers", [json!(10)]).with_stream_ids(["0", "1"]),
        );
        let bytes = codec().encode(&message).unwrap();
        assert_eq!(decode_one(&bytes), message);
    }

    #[test]
    fn non_blocking_invocation_has_nil_id() {
        let message = HubMessage::client_call("EchoBack", vec![json!("a")]);
        let bytes = codec().encode(&message).unwrap();
        assert_eq!(decode_one(&bytes), message);
    }

    #[test]
    fn close_without_allow_reconnect_field() {
        // [7, nil]
        let frame = [0x03, 0x92, 0x07, 0xc0];
        assert_eq!(decode_one(&frame), HubMessage::Close(Close::normal()));
    }

    #[test]
    fn partial_payload_needs_more_data() {
        let bytes = codec()
            .encode(&HubMessage::StreamItem(StreamItem::new("1", json!("a"))))
            .unwrap();
        assert!(codec().decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        // payload is a bare integer, not an array
        assert!(matches!(
            codec().decode(&[0x01, 0x05]),
            Err(ProtocolError::InvalidMessage(_))
        ));
        // [42]
        assert!(matches!(
            codec().decode(&[0x02, 0x91, 0x2a]),
            Err(ProtocolError::UnknownMessageType(42))
        ));
        // truncated msgpack string inside a complete frame
        assert!(matches!(
            codec().decode(&[0x02, 0xa5, b'a']),
            Err(ProtocolError::MessagePackDecode(_))
        ));
        // [6] followed by a stray byte inside the frame
        assert!(matches!(
            codec().decode(&[0x03, 0x91, 0x06, 0x00]),
            Err(ProtocolError::InvalidMessage(_))
        ));
        // stream ids must be strings
        assert!(matches!(
            codec().decode(&frame(&[0x96, 0x01, 0x80, 0xc0, 0xa1, b'X', 0x90, 0x91, 0x01])),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert!(matches!(
            codec().decode(&[0x00]),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let small = MessagePackCodec::new(4);
        let mut frame = Vec::new();
        write_length_prefix(10, &mut frame);
        assert!(matches!(
            small.decode(&frame),
            Err(ProtocolError::MessageTooLarge { size: 10, max: 4 })
        ));
    }
}
