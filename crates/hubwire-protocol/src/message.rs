//! The hub message vocabulary shared by every codec.
//!
//! These types are also what the relay carries between instances, so they
//! derive serde independently of the wire codecs.

use serde::{Deserialize, Serialize};

use crate::value::HubValue;

/// Message type numbers used on the wire by both codecs.
pub(crate) mod kind {
    pub const INVOCATION: u64 = 1;
    pub const STREAM_ITEM: u64 = 2;
    pub const COMPLETION: u64 = 3;
    pub const STREAM_INVOCATION: u64 = 4;
    pub const CANCEL_INVOCATION: u64 = 5;
    pub const PING: u64 = 6;
    pub const CLOSE: u64 = 7;
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubMessage {
    Invocation(Invocation),
    StreamItem(StreamItem),
    Completion(Completion),
    CancelInvocation { invocation_id: String },
    Ping,
    Close(Close),
}

impl HubMessage {
    /// Short name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Invocation(inv) if inv.streaming => "stream_invocation",
            Self::Invocation(_) => "invocation",
            Self::StreamItem(_) => "stream_item",
            Self::Completion(_) => "completion",
            Self::CancelInvocation { .. } => "cancel_invocation",
            Self::Ping => "ping",
            Self::Close(_) => "close",
        }
    }

    /// Builds a fire-and-forget invocation of a client-side method.
    pub fn client_call<A>(target: impl Into<String>, arguments: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<HubValue>,
    {
        Self::Invocation(Invocation::non_blocking(target, arguments))
    }
}

/// A request to run a method on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Caller-chosen id correlating the Completion. `None` means no reply is wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<HubValue>,
    /// The caller expects StreamItems before the Completion.
    #[serde(default)]
    pub streaming: bool,
    /// Ids of client-to-server upload streams.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_ids: Vec<String>,
}

impl Invocation {
    /// An invocation that expects a Completion.
    pub fn new<A>(invocation_id: impl Into<String>, target: impl Into<String>, arguments: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<HubValue>,
    {
        Self {
            invocation_id: Some(invocation_id.into()),
            ..Self::non_blocking(target, arguments)
        }
    }

    /// An invocation without an id; the callee sends nothing back.
    pub fn non_blocking<A>(target: impl Into<String>, arguments: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<HubValue>,
    {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            streaming: false,
            stream_ids: Vec::new(),
        }
    }

    /// A streaming invocation.
    pub fn streaming<A>(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: A,
    ) -> Self
    where
        A: IntoIterator,
        A::Item: Into<HubValue>,
    {
        Self {
            streaming: true,
            ..Self::new(invocation_id, target, arguments)
        }
    }

    /// Builder: attach client-to-server streams. Their items follow as
    /// StreamItems carrying these ids, ended by a Completion each.
    pub fn with_stream_ids<I>(mut self, stream_ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.stream_ids = stream_ids.into_iter().map(Into::into).collect();
        self
    }
}

/// One item of a streaming result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    pub invocation_id: String,
    pub item: HubValue,
}

impl StreamItem {
    pub fn new(invocation_id: impl Into<String>, item: impl Into<HubValue>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            item: item.into(),
        }
    }
}

/// Terminal message of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub invocation_id: String,
    pub outcome: CompletionOutcome,
}

/// What an invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The method returned nothing.
    Void,
    Result(HubValue),
    Error(String),
}

impl Completion {
    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Void,
        }
    }

    pub fn result(invocation_id: impl Into<String>, value: impl Into<HubValue>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Result(value.into()),
        }
    }

    pub fn error(invocation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, CompletionOutcome::Error(_))
    }

    /// The error text, if this completion failed.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Announces that the sender is about to close the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
}

impl Close {
    pub fn normal() -> Self {
        Self::default()
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            allow_reconnect: false,
        }
    }
}
