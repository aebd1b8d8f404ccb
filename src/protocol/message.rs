//! Message model for the stdio protocol.
//!
//! A message is a JSON object carrying a routing key (`type`, or `method`
//! when `type` is absent), an optional `id`, and arbitrary payload fields.
//! On the wire it may arrive bare or wrapped in an array envelope.

use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::config::EnvelopePolicy;

/// Primary routing key field.
pub const TYPE_FIELD: &str = "type";
/// Fallback routing key field used by `method`-style messages.
pub const METHOD_FIELD: &str = "method";
/// Identifier field.
pub const ID_FIELD: &str = "id";

/// Routing keys recognised by the built-in handlers.
pub mod keys {
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Reply to [`PING`].
    pub const PONG: &str = "pong";
    /// Echo request.
    pub const ECHO: &str = "echo";
    /// Reply to [`ECHO`].
    pub const ECHO_RESPONSE: &str = "echo_response";
    /// Arithmetic request.
    pub const CALCULATE: &str = "calculate";
    /// Successful reply to [`CALCULATE`].
    pub const CALCULATION_RESULT: &str = "calculation_result";
    /// Failed reply to [`CALCULATE`].
    pub const CALCULATION_ERROR: &str = "calculation_error";
    /// Shutdown request.
    pub const SHUTDOWN: &str = "shutdown";
    /// Reply to [`SHUTDOWN`].
    pub const SHUTDOWN_ACK: &str = "shutdown_ack";
    /// Supervisor readiness broadcast.
    pub const SERVER_READY: &str = "server_ready";
    /// Child readiness broadcast.
    pub const CLIENT_READY: &str = "client_ready";
    /// Diagnostic, never fatal.
    pub const ERROR: &str = "error";
    /// Child hello sent right after launch.
    pub const INIT: &str = "init";
}

/// Identifier assigned by a peer to its own outbound messages.
///
/// Only unique within one sender's stream; two peers may hand out the same
/// value independently.
pub type MessageId = u64;

/// One routable protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Wrap a JSON object.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Convert a JSON value into a message if it is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Routing key: `type` if it is a string, otherwise `method`.
    ///
    /// Returns `None` for messages that are not routable.
    #[must_use]
    pub fn routing_key(&self) -> Option<&str> {
        self.0
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .or_else(|| self.0.get(METHOD_FIELD).and_then(Value::as_str))
    }

    /// The `id` field, if present and not `null`.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.0.get(ID_FIELD).filter(|v| !v.is_null())
    }

    /// Look up a payload field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Borrow the underlying object.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert back into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Start a reply object of the given type, carrying `request`'s id if it had one.
#[must_use]
pub fn reply_to(request: &Message, reply_type: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(TYPE_FIELD.to_owned(), Value::String(reply_type.to_owned()));
    if let Some(id) = request.id() {
        fields.insert(ID_FIELD.to_owned(), id.clone());
    }
    fields
}

/// Turn one decoded wire value into the messages that should be routed.
///
/// Objects route as-is. Arrays follow `policy`; under
/// [`EnvelopePolicy::FirstOnly`] elements after the first are dropped and the
/// drop is logged. Empty arrays, non-object elements, and scalars are logged
/// and discarded.
#[must_use]
pub fn normalize_envelope(value: Value, policy: EnvelopePolicy) -> Vec<Message> {
    match value {
        Value::Object(map) => vec![Message(map)],
        Value::Array(items) => match policy {
            EnvelopePolicy::FirstOnly => {
                let total = items.len();
                let Some(first) = items.into_iter().next() else {
                    error!("envelope: empty array, nothing to route");
                    return Vec::new();
                };
                if total > 1 {
                    warn!(
                        dropped = total - 1,
                        "envelope: routing first element only, dropping the rest"
                    );
                }
                match Message::from_value(first) {
                    Some(message) => vec![message],
                    None => {
                        error!("envelope: first array element is not an object");
                        Vec::new()
                    }
                }
            }
            EnvelopePolicy::EachElement => {
                if items.is_empty() {
                    error!("envelope: empty array, nothing to route");
                }
                items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, item)| {
                        let message = Message::from_value(item);
                        if message.is_none() {
                            error!(index, "envelope: array element is not an object");
                        }
                        message
                    })
                    .collect()
            }
        },
        other => {
            error!(value = %other, "envelope: value is neither an object nor an array");
            Vec::new()
        }
    }
}
