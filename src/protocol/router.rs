//! Inbound routing table.
//!
//! A [`HandlerTable`] maps routing keys to handlers. It is assembled once
//! through [`HandlerTableBuilder`], shared behind an `Arc`, and never mutated
//! afterwards. Handlers run synchronously on the receive task and talk back
//! through a [`Dispatch`] context rather than holding the writer themselves,
//! so a handler can be exercised with nothing more than a message.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::protocol::message::Message;
use crate::Result;

/// Per-message context handed to a [`Handler`].
///
/// Collects replies (written by the receive loop, in order, once the handler
/// returns) and an optional request to stop receiving.
#[derive(Debug, Default)]
pub struct Dispatch {
    replies: Vec<Value>,
    stop: bool,
}

impl Dispatch {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply object.
    pub fn reply(&mut self, fields: Map<String, Value>) {
        self.replies.push(Value::Object(fields));
    }

    /// Ask the receive loop to exit after this message's replies are sent.
    pub fn stop_receiving(&mut self) {
        self.stop = true;
    }

    /// Replies queued so far.
    #[must_use]
    pub fn replies(&self) -> &[Value] {
        &self.replies
    }

    /// Whether the handler asked the loop to stop.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    /// Consume the context, yielding the queued replies.
    #[must_use]
    pub fn into_replies(self) -> Vec<Value> {
        self.replies
    }
}

/// Handler invoked for one routing key.
///
/// Returning `Err` is a fault: the receive loop logs it and terminates.
/// Recoverable failures belong in an error-typed reply instead.
pub trait Handler: Send + Sync {
    /// Handle `message`, queueing any replies on `dispatch`.
    ///
    /// # Errors
    ///
    /// Any error terminates the receive loop.
    fn handle(&self, message: &Message, dispatch: &mut Dispatch) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Message, &mut Dispatch) -> Result<()> + Send + Sync,
{
    fn handle(&self, message: &Message, dispatch: &mut Dispatch) -> Result<()> {
        self(message, dispatch)
    }
}

/// Immutable routing-key → handler map.
#[derive(Clone)]
pub struct HandlerTable {
    routes: Arc<BTreeMap<String, Arc<dyn Handler>>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("routes", &self.routing_keys())
            .finish()
    }
}

impl HandlerTable {
    /// Start building a table.
    #[must_use]
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// Find the handler registered for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<dyn Handler>> {
        self.routes.get(key)
    }

    /// Whether `key` has a handler.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.routes.contains_key(key)
    }

    /// Registered routing keys in sorted order.
    #[must_use]
    pub fn routing_keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }
}

/// Builder for [`HandlerTable`].
#[derive(Default)]
pub struct HandlerTableBuilder {
    routes: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerTableBuilder {
    /// Register `handler` for `key`, replacing any earlier registration.
    #[must_use]
    pub fn route(mut self, key: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.routes.insert(key.into(), Arc::new(handler));
        self
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> HandlerTable {
        HandlerTable {
            routes: Arc::new(self.routes),
        }
    }
}
