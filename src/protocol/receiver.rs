//! Receive loop.
//!
//! Reads NDJSON lines from a peer's output stream, decodes them, feeds the
//! [`Handshake`], and dispatches each routable message through the
//! [`HandlerTable`]. Replies queued by a handler are written through the
//! peer's [`OutboundSender`] before the next line is read.
//!
//! # Per-line outcome
//!
//! | Situation                      | Outcome                              |
//! |--------------------------------|--------------------------------------|
//! | empty line                     | skipped                              |
//! | malformed JSON / line too long | logged at `WARN`, skipped            |
//! | no routing key                 | skipped silently                     |
//! | key in table                   | handler runs; replies sent           |
//! | `shutdown` with no handler     | loop exits                           |
//! | `error` with no handler        | payload logged at `ERROR`, continue  |
//! | any other unknown key          | logged at `WARN`, skipped            |
//! | handler error or panic         | logged; loop exits; peer terminated  |
//! | EOF / I/O error                | loop exits; peer terminated          |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EnvelopePolicy;
use crate::protocol::codec::{decode_line, WireCodec};
use crate::protocol::handshake::{Handshake, Trigger};
use crate::protocol::message::{keys, normalize_envelope, Message};
use crate::protocol::router::{Dispatch, HandlerTable};
use crate::protocol::sender::OutboundSender;
use crate::AppError;

/// Why a receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The stream reached EOF.
    StreamClosed,
    /// The running flag was cleared.
    Cancelled,
    /// A `shutdown` message (or a handler) ended the loop.
    ShutdownRequested,
    /// A handler returned an error or panicked.
    HandlerFailed(String),
    /// The underlying stream failed.
    IoFailed(String),
}

/// Result of routing one message.
enum Step {
    Continue,
    Stop(LoopExit),
}

/// Everything a receive loop needs besides the stream itself.
#[derive(Debug, Clone)]
pub struct ReceiveLoop {
    table: HandlerTable,
    sender: OutboundSender,
    handshake: Arc<Handshake>,
    cancel: CancellationToken,
    envelope: EnvelopePolicy,
    max_line_bytes: usize,
}

impl ReceiveLoop {
    /// Bind a table, reply sender, handshake, and running flag.
    #[must_use]
    pub fn new(
        table: HandlerTable,
        sender: OutboundSender,
        handshake: Arc<Handshake>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table,
            sender,
            handshake,
            cancel,
            envelope: EnvelopePolicy::default(),
            max_line_bytes: crate::protocol::codec::MAX_LINE_BYTES,
        }
    }

    /// Override the array envelope rule.
    #[must_use]
    pub fn with_envelope_policy(mut self, envelope: EnvelopePolicy) -> Self {
        self.envelope = envelope;
        self
    }

    /// Override the inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Run until EOF, cancellation, shutdown, or a handler fault.
    ///
    /// The cancellation token is checked again after every line is read and
    /// before every envelope element, so nothing already buffered when the
    /// token fires is dispatched.
    pub async fn run<R>(self, reader: R) -> LoopExit
    where
        R: AsyncRead + Unpin + Send,
    {
        let peer = self.handshake.role().label();
        let mut framed =
            FramedRead::new(reader, WireCodec::with_max_line_bytes(self.max_line_bytes));

        let exit = loop {
            let item = tokio::select! {
                biased;

                () = self.cancel.cancelled() => break LoopExit::Cancelled,
                item = framed.next() => item,
            };

            if self.cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }

            let line = match item {
                None => {
                    debug!(peer, "receive loop: EOF detected");
                    break LoopExit::StreamClosed;
                }
                Some(Err(e)) => {
                    warn!(peer, error = %e, "receive loop: IO error, stopping");
                    break LoopExit::IoFailed(e.to_string());
                }
                Some(Ok(line)) => line,
            };

            let value = match decode_line(&line) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!(peer, error = %e, raw_line = %line, "receive loop: parse error, skipping line");
                    continue;
                }
            };

            let mut stop = None;
            for message in normalize_envelope(value, self.envelope) {
                if self.cancel.is_cancelled() {
                    stop = Some(LoopExit::Cancelled);
                    break;
                }
                if let Step::Stop(exit) = self.route(message).await {
                    stop = Some(exit);
                    break;
                }
            }
            if let Some(exit) = stop {
                break exit;
            }
        };

        match &exit {
            LoopExit::StreamClosed | LoopExit::IoFailed(_) => {
                self.handshake.apply(Trigger::StreamClosed);
            }
            LoopExit::HandlerFailed(_) => {
                self.handshake.apply(Trigger::LoopFailed);
            }
            LoopExit::Cancelled | LoopExit::ShutdownRequested => {}
        }

        info!(peer, ?exit, "receive loop finished");
        exit
    }

    async fn route(&self, message: Message) -> Step {
        let peer = self.handshake.role().label();
        let Some(key) = message.routing_key().map(str::to_owned) else {
            return Step::Continue;
        };

        self.handshake.observe(&message);

        let Some(handler) = self.table.get(&key) else {
            return match key.as_str() {
                keys::SHUTDOWN => {
                    info!(peer, "receive loop: shutdown received");
                    Step::Stop(LoopExit::ShutdownRequested)
                }
                keys::ERROR => {
                    error!(
                        peer,
                        payload = ?message.fields(),
                        "receive loop: peer reported an error"
                    );
                    Step::Continue
                }
                other => {
                    let err = AppError::Routing(format!("no handler for `{other}`"));
                    warn!(peer, error = %err, "receive loop: unknown routing key, ignoring");
                    Step::Continue
                }
            };
        };

        let mut dispatch = Dispatch::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&message, &mut dispatch)));

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(reason) = fault {
            error!(peer, routing_key = key.as_str(), error = %reason, "receive loop: handler failed, stopping");
            return Step::Stop(LoopExit::HandlerFailed(reason));
        }

        let stop = dispatch.stop_requested();
        for reply in dispatch.into_replies() {
            if let Err(e) = self.sender.send(reply).await {
                warn!(peer, routing_key = key.as_str(), error = %e, "receive loop: reply not delivered");
            }
        }

        if stop {
            Step::Stop(LoopExit::ShutdownRequested)
        } else {
            Step::Continue
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}
