//! Hub method tables.
//!
//! A [`HubMethodTable`] maps method names to typed callable descriptors. The
//! parameter list of every method is declared at registration time so
//! argument arity and types are checked before the method runs.
//!
//! ```rust
//! use hubwire_server::{HubMethodTable, HubValue, ParamKind};
//!
//! let table = HubMethodTable::new()
//!     .method("Add", &[ParamKind::Integer, ParamKind::Integer], |_ctx, args| async move {
//!         let a: i64 = args.get(0)?;
//!         let b: i64 = args.get(1)?;
//!         Ok(Some(HubValue::from(a + b)))
//!     });
//! assert!(table.get("add").is_some());
//! ```
//!
//! Parameters declared as [`ParamKind::Stream`] are fed by the client after
//! the invocation: each one is bound to an id from the invocation's
//! `streamIds` and read with [`Arguments::stream`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::StreamExt;
use futures_util::stream::{BoxStream, Stream};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::warn;

use hubwire_protocol::HubValue;

use crate::context::HubContext;
use crate::error::HubError;

/// A boxed future that can be sent across threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a unary method returns: a value, nothing (`None`), or an error.
pub type MethodResult = Result<Option<HubValue>, HubError>;

/// Items produced by a streaming method.
pub type ItemStream = BoxStream<'static, Result<HubValue, HubError>>;

type UnaryHandler = Arc<dyn Fn(HubContext, Arguments) -> BoxFuture<'static, MethodResult> + Send + Sync>;
type StreamHandler = Arc<dyn Fn(HubContext, Arguments) -> ItemStream + Send + Sync>;

/// Callback run when a connection joins or leaves a hub.
pub type LifecycleHook = Arc<dyn Fn(HubContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Declared type of one method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any value, including null.
    Any,
    String,
    Integer,
    /// Integer or floating point.
    Number,
    Bool,
    Array,
    Object,
    /// Raw bytes: `bin` on MessagePack, a base64 string on JSON.
    Binary,
    /// A stream uploaded by the client, bound to one of the invocation's
    /// stream ids rather than to a positional argument.
    Stream,
}

impl ParamKind {
    pub fn accepts(&self, value: &HubValue) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_integer(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_bool(),
            Self::Array => value.is_array(),
            Self::Object => value.is_map(),
            Self::Binary => value.to_bytes().is_some(),
            Self::Stream => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::Binary => "binary",
            Self::Stream => "stream",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

/// Items uploaded by the client for one stream parameter.
///
/// Ends when the client completes the stream. A client Completion carrying an
/// error, or the connection closing first, yields one `Err` before the end.
#[derive(Debug)]
pub struct ClientStream {
    stream_id: String,
    items: mpsc::UnboundedReceiver<Result<HubValue, HubError>>,
}

impl ClientStream {
    pub(crate) fn new(
        stream_id: impl Into<String>,
        items: mpsc::UnboundedReceiver<Result<HubValue, HubError>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            items,
        }
    }

    /// The id the client sends this stream's items under.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

impl Stream for ClientStream {
    type Item = Result<HubValue, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

/// Arguments of an invocation, already checked against the method's
/// parameter list.
///
/// Values and uploaded streams are indexed separately: `get(0)` is the first
/// non-stream parameter, `stream(0)` the first [`ParamKind::Stream`] one.
#[derive(Debug, Default)]
pub struct Arguments {
    values: Vec<HubValue>,
    streams: Vec<Option<ClientStream>>,
}

impl Arguments {
    pub fn new(values: Vec<HubValue>) -> Self {
        Self {
            values,
            streams: Vec::new(),
        }
    }

    pub(crate) fn with_streams(mut self, streams: Vec<ClientStream>) -> Self {
        self.streams = streams.into_iter().map(Some).collect();
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&HubValue> {
        self.values.get(index)
    }

    /// Deserializes the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, HubError> {
        self.required(index)?.to_typed().map_err(|e| {
            HubError::invalid_arguments(format!("argument {index} has the wrong type: {e}"))
        })
    }

    /// The bytes of a [`ParamKind::Binary`] argument.
    pub fn bytes(&self, index: usize) -> Result<Vec<u8>, HubError> {
        self.required(index)?.to_bytes().ok_or_else(|| {
            HubError::invalid_arguments(format!("argument {index} is not binary data"))
        })
    }

    /// Takes the uploaded stream bound to the `index`th stream parameter.
    /// Each stream can be taken once.
    pub fn stream(&mut self, index: usize) -> Result<ClientStream, HubError> {
        self.streams
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| HubError::invalid_arguments(format!("no client stream {index}")))
    }

    pub fn into_values(self) -> Vec<HubValue> {
        self.values
    }

    fn required(&self, index: usize) -> Result<&HubValue, HubError> {
        self.values
            .get(index)
            .ok_or_else(|| HubError::invalid_arguments(format!("missing argument {index}")))
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(UnaryHandler),
    Streaming(StreamHandler),
}

/// One registered method.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<ParamKind>,
    pub(crate) handler: Handler,
}

impl MethodDescriptor {
    /// The name as registered (lookup ignores case).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.handler, Handler::Streaming(_))
    }

    /// Number of parameters fed by client streams.
    pub fn stream_params(&self) -> usize {
        self.params.iter().filter(|p| p.is_stream()).count()
    }

    /// Checks argument count and types against the declared parameters.
    ///
    /// `streams` is the number of stream ids the invocation carries; they
    /// count towards the arity and must match the stream parameters exactly.
    pub fn check_arguments(&self, arguments: &[HubValue], streams: usize) -> Result<(), HubError> {
        if arguments.len() + streams != self.params.len() {
            return Err(HubError::invalid_arguments(format!(
                "Invocation provides {} argument(s) but target expects {}.",
                arguments.len() + streams,
                self.params.len()
            )));
        }
        let expected = self.stream_params();
        if streams != expected {
            return Err(HubError::invalid_arguments(format!(
                "Client sent {streams} stream(s), Hub method expects {expected}."
            )));
        }
        let values = self.params.iter().filter(|p| !p.is_stream());
        for (index, (param, value)) in values.zip(arguments).enumerate() {
            if !param.accepts(value) {
                return Err(HubError::invalid_arguments(format!(
                    "Error binding arguments. Argument {index} must be of type {}.",
                    param.name()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

/// The methods and lifecycle hooks of one hub.
///
/// Built once at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct HubMethodTable {
    methods: HashMap<String, MethodDescriptor>,
    on_connected: Option<LifecycleHook>,
    on_disconnected: Option<LifecycleHook>,
}

impl HubMethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, descriptor: MethodDescriptor) {
        let key = descriptor.name.to_lowercase();
        if let Some(previous) = self.methods.insert(key, descriptor) {
            warn!(method = %previous.name, "Hub method registered twice, keeping the last one");
        }
    }

    /// Registers a unary method.
    pub fn method<F, Fut>(mut self, name: &str, params: &[ParamKind], handler: F) -> Self
    where
        F: Fn(HubContext, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: UnaryHandler = Arc::new(move |ctx, args| Box::pin(handler(ctx, args)));
        self.insert(MethodDescriptor {
            name: name.to_string(),
            params: params.to_vec(),
            handler: Handler::Unary(handler),
        });
        self
    }

    /// Registers a streaming method.
    pub fn stream<F, S>(mut self, name: &str, params: &[ParamKind], handler: F) -> Self
    where
        F: Fn(HubContext, Arguments) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<HubValue, HubError>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.insert(MethodDescriptor {
            name: name.to_string(),
            params: params.to_vec(),
            handler: Handler::Streaming(handler),
        });
        self
    }

    /// Runs after a connection has joined the hub, before its first message is read.
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connected = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Runs after a connection has left the hub and its groups.
    pub fn on_disconnected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnected = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Looks a method up, ignoring case.
    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.methods.values().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn connected_hook(&self) -> Option<&LifecycleHook> {
        self.on_connected.as_ref()
    }

    pub(crate) fn disconnected_hook(&self) -> Option<&LifecycleHook> {
        self.on_disconnected.as_ref()
    }
}

impl fmt::Debug for HubMethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubMethodTable")
            .field("methods", &self.names())
            .finish()
    }
}
