//! NDJSON codec for the stdio protocol.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! peer that never writes a newline cannot make the reader allocate without
//! bound. Framing is one JSON value per `\n`-terminated line, which means a
//! corrupt line is recoverable: the next newline resynchronises the stream.
//!
//! An oversized line never surfaces as a decoder error. `FramedRead` treats
//! any decoder error as terminal, so the codec logs the rejection, discards
//! the line, and keeps decoding.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use pipelink::protocol::codec::WireCodec;
//!
//! let reader = FramedRead::new(child_stdout, WireCodec::new());
//! ```

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Default maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line framing codec for both directions of a peer connection.
///
/// # Decoder
///
/// Inbound lines longer than the configured limit are logged at `WARN`,
/// counted in [`WireCodec::discarded_lines`], and dropped; decoding resumes at
/// the next newline. I/O errors map to [`AppError::Io`].
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`. The limit is not enforced when
/// encoding.
#[derive(Debug)]
pub struct WireCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
    discarded: u64,
}

impl WireCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
            discarded: 0,
        }
    }

    /// Number of oversized lines dropped so far.
    #[must_use]
    pub fn discarded_lines(&self) -> u64 {
        self.discarded
    }

    fn next_line(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<String>> {
        loop {
            let decoded = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            match decoded {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    self.discarded += 1;
                    warn!(
                        max_line_bytes = self.max_line_bytes,
                        discarded = self.discarded,
                        "codec: line too long, discarding"
                    );
                }
                other => return other.map_err(|e| self.map_error(e)),
            }
        }
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::Decode(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_line(src, true)
    }
}

impl Encoder<String> for WireCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.lines.encode(item, dst).map_err(|e| self.map_error(e))
    }
}

/// Serialise `value` to a compact single line terminated by `\n`.
///
/// # Errors
///
/// Returns [`AppError::Decode`] if serialisation fails, which only happens
/// for maps with non-string keys and cannot occur for a [`Value`].
pub fn encode_line(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|e| AppError::Decode(format!("failed to serialise outbound message: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one framed line.
///
/// Returns `Ok(None)` for an empty or whitespace-only line.
///
/// # Errors
///
/// Returns [`AppError::Decode`]`("malformed json: …")` when the line is not
/// valid JSON.
pub fn decode_line(line: &str) -> Result<Option<Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value = serde_json::from_str(trimmed)?;
    Ok(Some(value))
}
