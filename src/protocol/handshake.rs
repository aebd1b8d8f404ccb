//! Readiness and shutdown state machine.
//!
//! Each peer owns one [`Handshake`]. The receive task is the only writer of
//! transitions driven by inbound traffic; the control side applies
//! `connected`, local shutdown requests and grace expiry. State is published
//! through a [`tokio::sync::watch`] channel so waiters are woken on change
//! instead of polling.
//!
//! | From                  | Trigger                | To            |
//! |-----------------------|------------------------|---------------|
//! | `Disconnected`        | `Connected`            | `Starting`    |
//! | `Starting`            | `Started`              | `AwaitingReady` |
//! | `AwaitingReady`       | `ReadinessReceived`    | `Ready`       |
//! | `AwaitingReady`/`Ready` | `ShutdownRequested`  | `ShuttingDown` |
//! | `ShuttingDown`        | `ShutdownAcknowledged` / `GraceElapsed` | `Terminated` |
//! | any but `Terminated`  | `StreamClosed` / `LoopFailed` | `Terminated` |
//!
//! Every other pair is ignored, so a repeated readiness message or a second
//! shutdown request cannot start another sequence.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::message::{keys, Message};
use crate::{AppError, Result};

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No process or stream yet.
    Disconnected,
    /// Pipes are connected.
    Starting,
    /// Waiting for the counterpart's readiness message.
    AwaitingReady,
    /// Both sides may exchange business messages.
    Ready,
    /// A shutdown sequence is in flight.
    ShuttingDown,
    /// Terminal.
    Terminated,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Event fed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Spawn or connect succeeded.
    Connected,
    /// Startup finished; applied immediately after `Connected`.
    Started,
    /// The counterpart's readiness message arrived.
    ReadinessReceived,
    /// A local stop or a remote `shutdown` message.
    ShutdownRequested,
    /// `shutdown_ack` arrived.
    ShutdownAcknowledged,
    /// The grace period after a shutdown request ran out.
    GraceElapsed,
    /// The inbound stream hit EOF or an I/O error.
    StreamClosed,
    /// A handler fault ended the receive loop.
    LoopFailed,
}

/// Which end of the pipe pair this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Spawns and owns the child; becomes ready on `client_ready`.
    Supervisor,
    /// Launched by the supervisor; becomes ready on `server_ready`.
    Child,
}

impl Role {
    /// Routing key of the readiness message this role waits for.
    #[must_use]
    pub fn readiness_key(self) -> &'static str {
        match self {
            Self::Supervisor => keys::CLIENT_READY,
            Self::Child => keys::SERVER_READY,
        }
    }

    /// Field of the readiness message listing the counterpart's routing keys.
    #[must_use]
    pub fn advertisement_field(self) -> &'static str {
        match self {
            Self::Supervisor => "capabilities",
            Self::Child => "supported_types",
        }
    }

    /// Short label for log fields.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Child => "child",
        }
    }
}

/// Pure transition function; `None` means the trigger is ignored in `from`.
#[must_use]
pub fn transition(from: PeerState, trigger: Trigger) -> Option<PeerState> {
    use PeerState::{AwaitingReady, Disconnected, Ready, ShuttingDown, Starting, Terminated};

    match (from, trigger) {
        (Terminated, _) => None,
        (_, Trigger::StreamClosed | Trigger::LoopFailed) => Some(Terminated),
        (Disconnected, Trigger::Connected) => Some(Starting),
        (Starting, Trigger::Started) => Some(AwaitingReady),
        (AwaitingReady, Trigger::ReadinessReceived) => Some(Ready),
        (AwaitingReady | Ready, Trigger::ShutdownRequested) => Some(ShuttingDown),
        (ShuttingDown, Trigger::ShutdownAcknowledged | Trigger::GraceElapsed) => Some(Terminated),
        _ => None,
    }
}

/// Shared handshake state for one peer.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: watch::Sender<PeerState>,
    advertised: Mutex<Option<Vec<String>>>,
}

impl Handshake {
    /// Create a handshake in [`PeerState::Disconnected`].
    #[must_use]
    pub fn new(role: Role) -> Self {
        let (state, _) = watch::channel(PeerState::Disconnected);
        Self {
            role,
            state,
            advertised: Mutex::new(None),
        }
    }

    /// This peer's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    /// Apply `trigger`; returns `true` if the state changed.
    pub fn apply(&self, trigger: Trigger) -> bool {
        let mut moved = None;
        self.state.send_if_modified(|current| match transition(*current, trigger) {
            Some(next) if next != *current => {
                moved = Some((*current, next));
                *current = next;
                true
            }
            _ => false,
        });

        match moved {
            Some((from, to)) => {
                info!(peer = self.role.label(), %from, %to, ?trigger, "peer state changed");
                true
            }
            None => {
                debug!(peer = self.role.label(), ?trigger, state = %self.state(), "trigger ignored");
                false
            }
        }
    }

    /// Pipes are up: `Disconnected → Starting → AwaitingReady`.
    pub fn connected(&self) {
        self.apply(Trigger::Connected);
        self.apply(Trigger::Started);
    }

    /// Begin the shutdown sequence; `true` only for the call that started it.
    pub fn begin_shutdown(&self) -> bool {
        self.apply(Trigger::ShutdownRequested)
    }

    /// Advance from an inbound routed message, recording readiness metadata.
    pub fn observe(&self, message: &Message) {
        let Some(key) = message.routing_key() else {
            return;
        };

        if key == self.role.readiness_key() {
            if self.apply(Trigger::ReadinessReceived) {
                self.record_advertisement(message);
            }
        } else if key == keys::SHUTDOWN {
            self.apply(Trigger::ShutdownRequested);
        } else if key == keys::SHUTDOWN_ACK {
            self.apply(Trigger::ShutdownAcknowledged);
        }
    }

    /// Routing keys the counterpart advertised in its readiness message.
    ///
    /// Advisory only; the router does not enforce it.
    #[must_use]
    pub fn advertised_keys(&self) -> Option<Vec<String>> {
        self.advertised
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Wait until `accept` holds for the state, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`] if the state is not reached in time.
    pub async fn wait_for<F>(&self, timeout: Duration, accept: F) -> Result<PeerState>
    where
        F: FnMut(&PeerState) -> bool,
    {
        let mut rx = self.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(accept))
            .await
            .map(|waited| waited.map(|state| *state));
        match outcome {
            Ok(Ok(state)) => Ok(state),
            // The sender lives in `self`, so the channel cannot close while borrowed.
            Ok(Err(_)) => Ok(self.state()),
            Err(_) => Err(AppError::Timeout(format!(
                "peer state still {} after {timeout:?}",
                self.state()
            ))),
        }
    }

    /// Wait for [`PeerState::Ready`].
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`] if readiness is not reached within `timeout`.
    /// - [`AppError::Process`] if the peer shut down or terminated first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let reached = self
            .wait_for(timeout, |s| {
                matches!(
                    s,
                    PeerState::Ready | PeerState::ShuttingDown | PeerState::Terminated
                )
            })
            .await?;

        if reached == PeerState::Ready {
            Ok(())
        } else {
            Err(AppError::Process(format!(
                "peer reached {reached} before becoming ready"
            )))
        }
    }

    fn record_advertisement(&self, message: &Message) {
        let field = self.role.advertisement_field();
        let advertised = message.get(field).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect::<Vec<_>>()
        });

        info!(peer = self.role.label(), ?advertised, "counterpart advertised routing keys");

        match self.advertised.lock() {
            Ok(mut guard) => *guard = advertised,
            Err(poisoned) => *poisoned.into_inner() = advertised,
        }
    }
}
