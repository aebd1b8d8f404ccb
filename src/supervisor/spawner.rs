//! Child process spawning and termination.
//!
//! Spawns the child with all three standard streams piped and
//! `kill_on_drop(true)`, marks its environment so it can tell it was
//! launched by a supervisor, relays its stderr into the supervisor's log, and
//! implements the terminate-then-kill escalation used by `stop`.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ChildCommand, LAUNCHED_ENV, SUPERVISOR_PID_ENV};
use crate::{AppError, Result};

/// A freshly spawned child with its pipes detached from the handle.
#[derive(Debug)]
pub struct SpawnedChild {
    /// Process handle; dropping it kills the process.
    pub child: Child,
    /// Messages toward the child.
    pub stdin: ChildStdin,
    /// Messages from the child.
    pub stdout: ChildStdout,
    /// The child's diagnostic output.
    pub stderr: ChildStderr,
}

/// How far `stop` had to escalate before the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The child exited on its own.
    None,
    /// A termination signal was sent once.
    Terminate,
    /// The child was force-killed.
    Kill,
}

/// Spawn `command` with piped stdio.
///
/// # Errors
///
/// - [`AppError::Process`]`("failed to spawn child: …")`: OS spawn failure,
///   e.g. missing executable or permission denied.
/// - [`AppError::Process`]`("failed to capture child …")`: a pipe was not
///   created.
pub fn spawn_child(command: &ChildCommand) -> Result<SpawnedChild> {
    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args)
        .envs(&command.env)
        .env(LAUNCHED_ENV, "1")
        .env(SUPERVISOR_PID_ENV, std::process::id().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Process(format!("failed to spawn child: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Process("failed to capture child stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Process("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Process("failed to capture child stderr".into()))?;

    info!(
        pid = child.id().unwrap_or(0),
        command = command.command.as_str(),
        "child process spawned"
    );

    Ok(SpawnedChild {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Relay each stderr line of the child into the supervisor's log.
#[must_use]
pub fn forward_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(peer = "child", line = %line, "child stderr"),
                Ok(None) => break,
                Err(err) => {
                    warn!(peer = "child", %err, "failed to read child stderr");
                    break;
                }
            }
        }
    })
}

/// Wait up to `window` for the child to exit, then escalate.
///
/// Escalation sends one termination signal (unix) and waits up to
/// `terminate_window`; a child still alive after that is force-killed.
///
/// # Errors
///
/// Returns [`AppError::Process`] if the child cannot be waited on or killed.
pub async fn reap(
    child: &mut Child,
    window: Duration,
    terminate_window: Duration,
) -> Result<(Escalation, Option<ExitStatus>)> {
    if let Ok(status) = tokio::time::timeout(window, child.wait()).await {
        let status = status.map_err(|err| AppError::Process(format!("wait failed: {err}")))?;
        return Ok((Escalation::None, Some(status)));
    }

    if send_terminate(child) {
        if let Ok(status) = tokio::time::timeout(terminate_window, child.wait()).await {
            let status =
                status.map_err(|err| AppError::Process(format!("wait failed: {err}")))?;
            return Ok((Escalation::Terminate, Some(status)));
        }
        warn!("child ignored termination signal, killing");
    }

    child
        .kill()
        .await
        .map_err(|err| AppError::Process(format!("failed to kill child: {err}")))?;
    let status = child
        .try_wait()
        .map_err(|err| AppError::Process(format!("wait failed: {err}")))?;
    Ok((Escalation::Kill, status))
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {
            info!(pid, "sent SIGTERM to child");
            true
        }
        Err(err) => {
            warn!(pid, %err, "failed to send SIGTERM to child");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    false
}
