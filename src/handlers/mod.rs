//! Built-in message handlers and the per-role handler tables.
//!
//! Handlers are plain functions (or closures built by the functions here)
//! so they can be tested in isolation with a [`Dispatch`] and a message.
//! None of them fail on bad input: a malformed `calculate` request becomes a
//! `calculation_error` reply, which keeps the receive loop alive.

pub mod arithmetic;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::protocol::message::{keys, reply_to, Message};
use crate::protocol::router::{Dispatch, Handler, HandlerTable};
use crate::Result;

/// Routing keys the child advertises in `client_ready`.
pub const CHILD_CAPABILITIES: &[&str] = &[keys::PING, keys::ECHO, keys::CALCULATE, keys::SHUTDOWN];

/// Reply types the supervisor routes back to the operator.
pub const RESPONSE_KEYS: &[&str] = &[
    keys::PONG,
    keys::ECHO_RESPONSE,
    keys::CALCULATION_RESULT,
    keys::CALCULATION_ERROR,
    keys::SHUTDOWN_ACK,
];

/// `ping` → `pong` carrying the request id and the current unix time.
///
/// # Errors
///
/// Never fails.
pub fn ping(message: &Message, dispatch: &mut Dispatch) -> Result<()> {
    let mut reply = reply_to(message, keys::PONG);
    reply.insert("timestamp".into(), json!(unix_timestamp()));
    dispatch.reply(reply);
    Ok(())
}

/// `echo` → `echo_response`; `speaker` prefixes the echoed text.
#[must_use]
pub fn echo(speaker: &'static str) -> impl Handler {
    move |message: &Message, dispatch: &mut Dispatch| -> Result<()> {
        let original = message.get("message").cloned().unwrap_or(Value::Null);
        let text = match &original {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        info!(speaker, text = text.as_str(), "echo requested");

        let mut reply = reply_to(message, keys::ECHO_RESPONSE);
        reply.insert("original_message".into(), original);
        reply.insert(
            "echoed_message".into(),
            Value::String(format!("{speaker} echoes: {text}")),
        );
        dispatch.reply(reply);
        Ok(())
    }
}

/// `calculate` → `calculation_result` or `calculation_error`.
///
/// # Errors
///
/// Never fails; evaluation problems become a `calculation_error` reply.
pub fn calculate(message: &Message, dispatch: &mut Dispatch) -> Result<()> {
    let expression = message.get("expression").cloned().unwrap_or(Value::Null);

    let outcome = match &expression {
        Value::String(text) => arithmetic::evaluate(text).map_err(|e| e.to_string()),
        Value::Null => arithmetic::evaluate("").map_err(|e| e.to_string()),
        _ => Err("expression must be a string".to_owned()),
    };

    let reply = match outcome {
        Ok(result) => {
            info!(%expression, %result, "calculation succeeded");
            let mut reply = reply_to(message, keys::CALCULATION_RESULT);
            reply.insert("expression".into(), expression);
            reply.insert("result".into(), result.to_json());
            reply
        }
        Err(reason) => {
            info!(%expression, error = reason.as_str(), "calculation rejected");
            let mut reply = reply_to(message, keys::CALCULATION_ERROR);
            reply.insert("expression".into(), expression);
            reply.insert("error".into(), Value::String(reason));
            reply
        }
    };

    dispatch.reply(reply);
    Ok(())
}

/// `shutdown` → `shutdown_ack`, then stop receiving.
#[must_use]
pub fn shutdown(speaker: &'static str) -> impl Handler {
    move |message: &Message, dispatch: &mut Dispatch| -> Result<()> {
        info!(speaker, "shutdown requested by peer");
        dispatch.reply(shutdown_ack(message, speaker));
        dispatch.stop_receiving();
        Ok(())
    }
}

/// `shutdown` → `shutdown_ack`, but keep receiving until the peer closes
/// its stream.
///
/// Used by the supervisor, which must still see the child's EOF to finish
/// the shutdown.
#[must_use]
pub fn acknowledge_shutdown(speaker: &'static str) -> impl Handler {
    move |message: &Message, dispatch: &mut Dispatch| -> Result<()> {
        info!(speaker, "shutdown requested by peer, waiting for it to close");
        dispatch.reply(shutdown_ack(message, speaker));
        Ok(())
    }
}

fn shutdown_ack(message: &Message, speaker: &str) -> Map<String, Value> {
    let mut reply = reply_to(message, keys::SHUTDOWN_ACK);
    reply.insert(
        "message".into(),
        Value::String(format!("{speaker} shutting down")),
    );
    reply
}

/// Child side of the readiness handshake: answer `server_ready` with
/// `client_ready` advertising `capabilities`.
#[must_use]
pub fn answer_server_ready(capabilities: Vec<String>) -> impl Handler {
    move |message: &Message, dispatch: &mut Dispatch| -> Result<()> {
        info!(
            announcement = ?message.get("message"),
            supported_types = ?message.get("supported_types"),
            "supervisor is ready"
        );
        let mut reply = Map::new();
        reply.insert("type".into(), json!(keys::CLIENT_READY));
        reply.insert(
            "message".into(),
            json!("Client is ready to receive messages"),
        );
        reply.insert("capabilities".into(), json!(&capabilities));
        dispatch.reply(reply);
        Ok(())
    }
}

/// Log a message without replying.
///
/// # Errors
///
/// Never fails.
pub fn log_only(message: &Message, _dispatch: &mut Dispatch) -> Result<()> {
    match message.routing_key() {
        Some(keys::CALCULATION_ERROR) => {
            error!(routing_key = keys::CALCULATION_ERROR, payload = ?message.fields(), "peer reply");
        }
        key => info!(routing_key = ?key, payload = ?message.fields(), "peer message"),
    }
    Ok(())
}

/// Log a message and hand a copy to `inbound`.
///
/// A closed channel is not a fault: the owner stopped listening.
#[must_use]
pub fn forward(inbound: mpsc::UnboundedSender<Message>) -> impl Handler {
    move |message: &Message, dispatch: &mut Dispatch| -> Result<()> {
        log_only(message, dispatch)?;
        let _ = inbound.send(message.clone());
        Ok(())
    }
}

/// Handler table used by the child peer.
#[must_use]
pub fn child_table() -> HandlerTable {
    let capabilities = CHILD_CAPABILITIES.iter().map(|&k| k.to_owned()).collect();

    let mut builder = HandlerTable::builder()
        .route(keys::PING, ping)
        .route(keys::ECHO, echo("Client"))
        .route(keys::CALCULATE, calculate)
        .route(keys::SHUTDOWN, shutdown("Client"))
        .route(keys::SERVER_READY, answer_server_ready(capabilities));
    for &key in RESPONSE_KEYS {
        builder = builder.route(key, log_only);
    }
    builder.build()
}

/// Handler table used by the supervisor.
///
/// Replies to the supervisor's own requests go to `inbound` when given,
/// otherwise they are only logged.
#[must_use]
pub fn supervisor_table(inbound: Option<mpsc::UnboundedSender<Message>>) -> HandlerTable {
    let mut builder = HandlerTable::builder()
        .route(keys::PING, ping)
        .route(keys::ECHO, echo("Server"))
        .route(keys::CALCULATE, calculate)
        .route(keys::SHUTDOWN, acknowledge_shutdown("Server"))
        .route(keys::CLIENT_READY, log_only)
        .route(keys::INIT, log_only);
    for &key in RESPONSE_KEYS {
        builder = match &inbound {
            Some(tx) => builder.route(key, forward(tx.clone())),
            None => builder.route(key, log_only),
        };
    }
    builder.build()
}

/// Current unix time in fractional seconds.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
