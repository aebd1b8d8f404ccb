//! Outbound message sender.
//!
//! Stamps identifiers onto outbound messages and writes each one as a
//! flushed NDJSON line. One [`OutboundSender`] exists per peer stream; clones
//! share the same writer and counter, so lines from concurrent callers never
//! interleave and identifiers never repeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::codec::encode_line;
use crate::protocol::message::{MessageId, ID_FIELD};
use crate::{AppError, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Clonable handle writing identifier-stamped NDJSON lines to one stream.
#[derive(Clone)]
pub struct OutboundSender {
    peer: &'static str,
    writer: Arc<Mutex<BoxedWriter>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for OutboundSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSender")
            .field("peer", &self.peer)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl OutboundSender {
    /// Wrap `writer`; `peer` labels log lines.
    pub fn new<W>(peer: &'static str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Assign identifiers, serialise, write, and flush one message.
    ///
    /// Objects lacking an `id` (absent or `null`) receive the next counter
    /// value. Arrays get the same treatment per object element. Existing
    /// identifiers are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the write or flush fails, typically
    /// because the peer closed its end of the pipe.
    pub async fn send(&self, mut message: Value) -> Result<()> {
        self.stamp_ids(&mut message);
        let bytes = encode_line(&message)?;

        let mut writer = self.writer.lock().await;
        let outcome = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        drop(writer);

        match outcome {
            Ok(()) => {
                debug!(peer = self.peer, line = %message, "sent");
                Ok(())
            }
            Err(err) => {
                warn!(peer = self.peer, error = %err, "write to peer failed");
                Err(AppError::Transport(format!("write failed: {err}")))
            }
        }
    }

    /// Shut down the underlying writer, signalling EOF to the reader.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the shutdown fails.
    pub async fn close(&self) -> Result<()> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|err| AppError::Transport(format!("close failed: {err}")))
    }

    fn stamp_ids(&self, message: &mut Value) {
        match message {
            Value::Object(_) => self.stamp_one(message),
            Value::Array(items) => items.iter_mut().for_each(|item| self.stamp_one(item)),
            _ => {}
        }
    }

    fn stamp_one(&self, item: &mut Value) {
        let Value::Object(map) = item else {
            return;
        };
        if map.get(ID_FIELD).is_some_and(|id| !id.is_null()) {
            return;
        }
        map.insert(ID_FIELD.to_owned(), Value::from(self.next_id()));
    }

    fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
