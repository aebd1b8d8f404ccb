//! Child side of the protocol.
//!
//! A [`ChildPeer`] speaks the protocol over any reader/writer pair; the
//! `pipelink-child` binary binds it to the process's own stdin and stdout.
//! On start it announces itself with an `init` hello, then receives until
//! the supervisor shuts it down or closes the pipe.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{ProtocolConfig, LAUNCHED_ENV, SUPERVISOR_PID_ENV};
use crate::protocol::handshake::{Handshake, Role, Trigger};
use crate::protocol::message::keys;
use crate::protocol::receiver::{LoopExit, ReceiveLoop};
use crate::protocol::router::HandlerTable;
use crate::protocol::sender::OutboundSender;
use crate::{AppError, Result};

/// Protocol version announced in the `init` hello.
pub const PROTOCOL_VERSION: &str = "1.0";

/// How the child process was launched, read from its environment.
///
/// Informational only; protocol behaviour never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchInfo {
    /// `PIPELINK_LAUNCHED` was `1`.
    pub launched_by_supervisor: bool,
    /// Parsed `PIPELINK_SUPERVISOR_PID`.
    pub supervisor_pid: Option<u32>,
}

impl LaunchInfo {
    /// Read the launch markers from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let launched = std::env::var(LAUNCHED_ENV).ok();
        let pid = std::env::var(SUPERVISOR_PID_ENV).ok();
        Self::from_vars(launched.as_deref(), pid.as_deref())
    }

    /// Interpret raw marker values.
    #[must_use]
    pub fn from_vars(launched: Option<&str>, supervisor_pid: Option<&str>) -> Self {
        Self {
            launched_by_supervisor: launched.map(str::trim) == Some("1"),
            supervisor_pid: supervisor_pid.and_then(|p| p.trim().parse().ok()),
        }
    }
}

/// The child end of a supervisor/child pipe pair.
#[derive(Debug)]
pub struct ChildPeer {
    table: HandlerTable,
    protocol: ProtocolConfig,
    handshake: Arc<Handshake>,
    cancel: CancellationToken,
}

impl ChildPeer {
    /// Create a peer routing through `table`.
    #[must_use]
    pub fn new(table: HandlerTable, protocol: ProtocolConfig) -> Self {
        Self {
            table,
            protocol,
            handshake: Arc::new(Handshake::new(Role::Child)),
            cancel: CancellationToken::new(),
        }
    }

    /// Shared handshake state, for observing readiness and shutdown.
    #[must_use]
    pub fn handshake(&self) -> Arc<Handshake> {
        Arc::clone(&self.handshake)
    }

    /// Token that stops the receive loop at its next line.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send the `init` hello and receive until the loop ends.
    ///
    /// The output stream is shut down on return and the peer ends in
    /// [`PeerState::Terminated`](crate::protocol::handshake::PeerState::Terminated).
    ///
    /// # Errors
    ///
    /// - [`AppError::Transport`] if the hello cannot be written.
    /// - [`AppError::Process`] if the receive task itself panics.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<LoopExit>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let sender = OutboundSender::new(Role::Child.label(), writer);
        self.handshake.connected();

        sender
            .send(json!({
                "jsonrpc": "2.0",
                "id": uuid::Uuid::new_v4().to_string(),
                "method": keys::INIT,
                "params": { "protocol_version": PROTOCOL_VERSION },
            }))
            .await?;

        let receive_loop = ReceiveLoop::new(
            self.table,
            sender.clone(),
            Arc::clone(&self.handshake),
            self.cancel,
        )
        .with_envelope_policy(self.protocol.envelope)
        .with_max_line_bytes(self.protocol.max_line_bytes);

        let exit = tokio::spawn(receive_loop.run(reader).instrument(info_span!("receive_loop")))
            .await
            .map_err(|err| AppError::Process(format!("receive task failed: {err}")))?;

        if let Err(err) = sender.close().await {
            warn!(%err, "failed to close output stream");
        }
        self.handshake.apply(Trigger::StreamClosed);
        info!(?exit, state = %self.handshake.state(), "child peer finished");
        Ok(exit)
    }
}
