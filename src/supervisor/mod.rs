//! Process supervisor.
//!
//! Owns one child process for one start/stop cycle: spawns it, binds a
//! receive loop to its stdout and an [`OutboundSender`] to its stdin, drives
//! the readiness handshake, and on `stop` runs the graceful shutdown with
//! escalation to a termination signal and finally a kill.
//!
//! There is no restart: once stopped, a supervisor stays stopped.

pub mod spawner;

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{ChildCommand, ProtocolConfig, TimeoutConfig};
use crate::protocol::handshake::{Handshake, PeerState, Role, Trigger};
use crate::protocol::message::keys;
use crate::protocol::receiver::{LoopExit, ReceiveLoop};
use crate::protocol::router::HandlerTable;
use crate::protocol::sender::OutboundSender;
use crate::{AppError, Result};

pub use spawner::Escalation;

/// Bound on waiting for the receive and stderr tasks once the child is gone.
const TASK_DRAIN: Duration = Duration::from_secs(1);

/// Outcome of a completed [`ProcessSupervisor::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// The peer reached `Terminated` within the grace period.
    pub graceful: bool,
    /// How far termination had to escalate.
    pub escalation: Escalation,
    /// Exit code, if the child exited normally.
    pub exit_code: Option<i32>,
    /// Why the receive loop stopped, if it could be collected.
    pub loop_exit: Option<LoopExit>,
}

/// Resources that exist only between `start` and `stop`.
struct Session {
    child: Child,
    sender: OutboundSender,
    handshake: Arc<Handshake>,
    cancel: CancellationToken,
    receiver: JoinHandle<LoopExit>,
    stderr: JoinHandle<()>,
    grace_watch: JoinHandle<()>,
}

/// Spawns and supervises a single child peer.
pub struct ProcessSupervisor {
    table: HandlerTable,
    timeouts: TimeoutConfig,
    protocol: ProtocolConfig,
    session: Option<Session>,
    handshake: Option<Arc<Handshake>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("table", &self.table)
            .field("state", &self.state())
            .field("running", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor that will route inbound traffic through `table`.
    #[must_use]
    pub fn new(table: HandlerTable, timeouts: TimeoutConfig, protocol: ProtocolConfig) -> Self {
        Self {
            table,
            timeouts,
            protocol,
            session: None,
            handshake: None,
        }
    }

    /// Spawn the child, start receiving, and send `server_ready`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Process`] if this supervisor was already started or the
    ///   spawn fails. Spawn failures are not retried.
    /// - [`AppError::Transport`] if `server_ready` cannot be written.
    pub async fn start(&mut self, command: &ChildCommand) -> Result<()> {
        if self.handshake.is_some() {
            return Err(AppError::Process(
                "supervisor already started; one start/stop cycle per supervisor".into(),
            ));
        }

        let spawned = spawner::spawn_child(command)?;
        let pid = spawned.child.id().unwrap_or(0);

        let handshake = Arc::new(Handshake::new(Role::Supervisor));
        handshake.connected();

        let sender = OutboundSender::new(Role::Supervisor.label(), spawned.stdin);
        let cancel = CancellationToken::new();

        let receive_loop = ReceiveLoop::new(
            self.table.clone(),
            sender.clone(),
            Arc::clone(&handshake),
            cancel.clone(),
        )
        .with_envelope_policy(self.protocol.envelope)
        .with_max_line_bytes(self.protocol.max_line_bytes);

        let receiver = tokio::spawn(
            receive_loop
                .run(spawned.stdout)
                .instrument(info_span!("receive_loop", pid)),
        );
        let stderr = spawner::forward_stderr(spawned.stderr);
        let grace_watch = tokio::spawn(
            watch_remote_shutdown(Arc::clone(&handshake), self.timeouts.grace(), cancel.clone())
                .instrument(info_span!("grace_watch", pid)),
        );

        self.handshake = Some(Arc::clone(&handshake));
        self.session = Some(Session {
            child: spawned.child,
            sender,
            handshake,
            cancel,
            receiver,
            stderr,
            grace_watch,
        });

        self.send(json!({
            "type": keys::SERVER_READY,
            "message": "Server is ready to receive messages",
            "supported_types": self.table.routing_keys(),
        }))
        .await
    }

    /// Send one message to the child.
    ///
    /// # Errors
    ///
    /// - [`AppError::Process`] if no child is running.
    /// - [`AppError::Transport`] if the pipe is closed. Not retried.
    pub async fn send(&self, message: Value) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AppError::Process("no child process is running".into()))?;
        session.sender.send(message).await
    }

    /// Wait until the child has answered the handshake.
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`] if `timeout` elapses first.
    /// - [`AppError::Process`] if the child was never started, or exited or
    ///   shut down before becoming ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let handshake = self
            .handshake
            .as_ref()
            .ok_or_else(|| AppError::Process("supervisor not started".into()))?;
        handshake.wait_ready(timeout).await
    }

    /// Current peer state; `Disconnected` before `start`.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.handshake
            .as_ref()
            .map_or(PeerState::Disconnected, |h| h.state())
    }

    /// Watch peer state changes; `None` before `start`.
    #[must_use]
    pub fn subscribe(&self) -> Option<watch::Receiver<PeerState>> {
        self.handshake.as_ref().map(|h| h.subscribe())
    }

    /// Routing keys the child advertised in `client_ready`.
    #[must_use]
    pub fn advertised_keys(&self) -> Option<Vec<String>> {
        self.handshake.as_ref().and_then(|h| h.advertised_keys())
    }

    /// Child process id while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.child.id())
    }

    /// Shut the child down, escalating if it does not cooperate.
    ///
    /// Sends `shutdown`, waits up to `grace_period` for the peer to reach
    /// `Terminated` (via `shutdown_ack` or EOF), then gives the process
    /// whatever is left of the same grace period to exit before sending one
    /// termination signal and finally killing it.
    ///
    /// Returns `Ok(None)` when there is nothing to stop; repeated calls never
    /// signal a process twice.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] if the child cannot be waited on or killed.
    pub async fn stop(&mut self, grace_period: Duration) -> Result<Option<StopReport>> {
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        let terminate_window = self.timeouts.terminate();
        let span = info_span!("stop", pid = session.child.id().unwrap_or(0));

        async move {
            // `stop` owns the grace period from here on.
            session.grace_watch.abort();
            let deadline = Instant::now() + grace_period;
            if session.handshake.begin_shutdown() {
                if let Err(err) = session.sender.send(json!({ "type": keys::SHUTDOWN })).await {
                    warn!(%err, "shutdown message not delivered");
                }
            }

            let graceful = session
                .handshake
                .wait_for(grace_period, |s| *s == PeerState::Terminated)
                .await
                .is_ok();
            if !graceful {
                info!(?grace_period, "grace period elapsed without shutdown_ack");
                session.handshake.apply(Trigger::GraceElapsed);
            }

            let window = deadline.saturating_duration_since(Instant::now());
            let (escalation, status) =
                spawner::reap(&mut session.child, window, terminate_window).await?;

            session.cancel.cancel();
            let loop_exit = drain(session.receiver).await;
            drain(session.stderr).await;

            let report = StopReport {
                graceful,
                escalation,
                exit_code: status.as_ref().and_then(ExitStatus::code),
                loop_exit,
            };
            info!(?report, "child stopped");
            Ok(Some(report))
        }
        .instrument(span)
        .await
    }
}

/// Bound a shutdown the child started.
///
/// Once the peer enters `ShuttingDown` without a local `stop`, the child has
/// `grace` to close its output; after that the peer is marked `Terminated`
/// so waiters are released. The process itself is still reaped by `stop`.
async fn watch_remote_shutdown(
    handshake: Arc<Handshake>,
    grace: Duration,
    cancel: CancellationToken,
) {
    let mut state = handshake.subscribe();
    let reached = tokio::select! {
        () = cancel.cancelled() => return,
        reached = state.wait_for(|s| matches!(s, PeerState::ShuttingDown | PeerState::Terminated)) => {
            reached.map(|s| *s)
        }
    };
    if !matches!(reached, Ok(PeerState::ShuttingDown)) {
        return;
    }

    tokio::select! {
        () = cancel.cancelled() => {}
        outcome = handshake.wait_for(grace, |s| *s == PeerState::Terminated) => {
            if outcome.is_err() {
                info!(?grace, "peer still shutting down after grace period");
                handshake.apply(Trigger::GraceElapsed);
            }
        }
    }
}

async fn drain<T>(mut handle: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(TASK_DRAIN, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(%err, "background task failed");
            None
        }
        Err(_) => {
            warn!("background task did not finish, aborting");
            handle.abort();
            None
        }
    }
}
