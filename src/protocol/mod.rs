//! Line-delimited JSON protocol between a supervisor and its child.
//!
//! Each peer owns one outbound writer, one receive loop, and one handshake
//! state machine:
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing and
//!   JSON line encode/decode.
//! - `message`: the routable message model and array envelope handling.
//! - `sender`: identifier assignment and flushed line writes.
//! - `router`: the immutable routing-key → handler table.
//! - `receiver`: the background loop that reads, decodes, and dispatches.
//! - `handshake`: readiness and shutdown progress for one peer.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod receiver;
pub mod router;
pub mod sender;
