//! Text protocol: one JSON object per frame, terminated by `0x1E`.
//!
//! ```text
//! {"arguments":["hi"],"invocationId":"1","target":"Echo","type":1}\x1e
//! ```
//!
//! Re-encoding a decoded frame reproduces it byte for byte. Values cross
//! into [`HubValue`] at this edge; binary values go out as base64 strings.

use serde_json::{Map, Value, json};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::RECORD_SEPARATOR;
use crate::message::{Close, Completion, CompletionOutcome, HubMessage, Invocation, StreamItem, kind};
use crate::value::HubValue;
use crate::{HubCodec, MAX_MESSAGE_SIZE};

/// The `json` hub protocol.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_message_size: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl JsonCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    // Keys are inserted alphabetically so the output is identical whether or
    // not serde_json preserves insertion order.
    fn to_value(message: &HubMessage) -> Value {
        let mut map = Map::new();
        match message {
            HubMessage::Invocation(inv) => {
                let ty = if inv.streaming {
                    kind::STREAM_INVOCATION
                } else {
                    kind::INVOCATION
                };
                map.insert(
                    "arguments".into(),
                    Value::Array(inv.arguments.iter().map(HubValue::to_json).collect()),
                );
                if let Some(ref id) = inv.invocation_id {
                    map.insert("invocationId".into(), json!(id));
                }
                if !inv.stream_ids.is_empty() {
                    map.insert("streamIds".into(), json!(inv.stream_ids));
                }
                map.insert("target".into(), json!(inv.target));
                map.insert("type".into(), json!(ty));
            }
            HubMessage::StreamItem(item) => {
                map.insert("invocationId".into(), json!(item.invocation_id));
                map.insert("item".into(), item.item.to_json());
                map.insert("type".into(), json!(kind::STREAM_ITEM));
            }
            HubMessage::Completion(completion) => {
                if let CompletionOutcome::Error(error) = &completion.outcome {
                    map.insert("error".into(), json!(error));
                }
                map.insert("invocationId".into(), json!(completion.invocation_id));
                if let CompletionOutcome::Result(value) = &completion.outcome {
                    map.insert("result".into(), value.to_json());
                }
                map.insert("type".into(), json!(kind::COMPLETION));
            }
            HubMessage::CancelInvocation { invocation_id } => {
                map.insert("invocationId".into(), json!(invocation_id));
                map.insert("type".into(), json!(kind::CANCEL_INVOCATION));
            }
            HubMessage::Ping => {
                map.insert("type".into(), json!(kind::PING));
            }
            HubMessage::Close(close) => {
                if close.allow_reconnect {
                    map.insert("allowReconnect".into(), json!(true));
                }
                if let Some(ref error) = close.error {
                    map.insert("error".into(), json!(error));
                }
                map.insert("type".into(), json!(kind::CLOSE));
            }
        }
        Value::Object(map)
    }

    fn from_value(value: Value) -> ProtocolResult<HubMessage> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::invalid("frame is not a JSON object"));
        };

        let ty = map
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::invalid("missing or non-integer 'type'"))?;

        let message = match ty {
            kind::INVOCATION | kind::STREAM_INVOCATION => {
                let streaming = ty == kind::STREAM_INVOCATION;
                let invocation_id = optional_string(&map, "invocationId")?;
                if streaming && invocation_id.is_none() {
                    return Err(ProtocolError::invalid(
                        "stream invocation requires 'invocationId'",
                    ));
                }
                let target = required_string(&map, "target")?;
                let arguments = match map.remove("arguments") {
                    Some(Value::Array(args)) => args.into_iter().map(HubValue::from_json).collect(),
                    Some(_) => return Err(ProtocolError::invalid("'arguments' must be an array")),
                    None => return Err(ProtocolError::invalid("missing 'arguments'")),
                };
                let stream_ids = match map.remove("streamIds") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(ids) => serde_json::from_value(ids)
                        .map_err(|_| ProtocolError::invalid("'streamIds' must be strings"))?,
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
                let invocation_id = required_string(&map, "invocationId")?;
                let item = HubValue::from_json(map.remove("item").unwrap_or(Value::Null));
                HubMessage::StreamItem(StreamItem {
                    invocation_id,
                    item,
                })
            }
            kind::COMPLETION => {
                let invocation_id = required_string(&map, "invocationId")?;
                let error = optional_string(&map, "error")?;
                let outcome = match (error, map.remove("result")) {
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::invalid(
                            "completion carries both 'result' and 'error'",
                        ));
                    }
                    (Some(error), None) => CompletionOutcome::Error(error),
                    (None, Some(result)) => CompletionOutcome::Result(HubValue::from_json(result)),
                    (None, None) => CompletionOutcome::Void,
                };
                HubMessage::Completion(Completion {
                    invocation_id,
                    outcome,
                })
            }
            kind::CANCEL_INVOCATION => HubMessage::CancelInvocation {
                invocation_id: required_string(&map, "invocationId")?,
            },
            kind::PING => HubMessage::Ping,
            kind::CLOSE => HubMessage::Close(Close {
                error: optional_string(&map, "error")?,
                allow_reconnect: map
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

fn required_string(map: &Map<String, Value>, key: &str) -> ProtocolResult<String> {
    optional_string(map, key)?.ok_or_else(|| ProtocolError::invalid(format!("missing '{key}'")))
}

fn optional_string(map: &Map<String, Value>, key: &str) -> ProtocolResult<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::invalid(format!("'{key}' must be a string"))),
    }
}

impl HubCodec for JsonCodec {
    fn encode(&self, message: &HubMessage) -> ProtocolResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&Self::to_value(message))?;
        if bytes.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        bytes.push(RECORD_SEPARATOR);
        Ok(bytes)
    }

    fn decode(&self, buf: &[u8]) -> ProtocolResult<Option<(HubMessage, usize)>> {
        let Some(end) = buf.iter().position(|b| *b == RECORD_SEPARATOR) else {
            if buf.len() > self.max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: buf.len(),
                    max: self.max_message_size,
                });
            }
            return Ok(None);
        };

        if end == 0 {
            return Err(ProtocolError::EmptyMessage);
        }
        if end > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: end,
                max: self.max_message_size,
            });
        }

        let value: Value = serde_json::from_slice(&buf[..end])?;
        Ok(Some((Self::from_value(value)?, end + 1)))
    }
}
