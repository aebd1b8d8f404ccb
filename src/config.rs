//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment variable set to `1` in every child launched by the supervisor.
pub const LAUNCHED_ENV: &str = "PIPELINK_LAUNCHED";

/// Environment variable carrying the supervisor's process identifier.
pub const SUPERVISOR_PID_ENV: &str = "PIPELINK_SUPERVISOR_PID";

/// Smallest accepted `max_line_bytes`; anything lower cannot hold a handshake.
const MIN_LINE_BYTES: usize = 64;

/// The child process to launch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChildCommand {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ChildCommand {
    /// Build a command with no extra environment.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}

/// Bounded waits (milliseconds) used by the supervisor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Maximum wait for the readiness handshake.
    #[serde(default = "default_ready_ms")]
    pub ready_ms: u64,
    /// Grace period after `shutdown` before escalating.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Wait after the termination signal before force-killing.
    #[serde(default = "default_terminate_ms")]
    pub terminate_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_ms: default_ready_ms(),
            grace_ms: default_grace_ms(),
            terminate_ms: default_terminate_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Readiness timeout as a [`Duration`].
    #[must_use]
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Post-signal wait as a [`Duration`].
    #[must_use]
    pub fn terminate(&self) -> Duration {
        Duration::from_millis(self.terminate_ms)
    }
}

fn default_ready_ms() -> u64 {
    10_000
}

fn default_grace_ms() -> u64 {
    1_000
}

fn default_terminate_ms() -> u64 {
    5_000
}

fn default_max_line_bytes() -> usize {
    crate::protocol::codec::MAX_LINE_BYTES
}

/// How a JSON array received on the wire is turned into routable messages.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePolicy {
    /// Route only the first element; later elements are dropped with a warning.
    #[default]
    FirstOnly,
    /// Route every object element in order.
    EachElement,
}

/// Wire-level protocol settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProtocolConfig {
    /// Longest accepted inbound line in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Array envelope handling.
    #[serde(default)]
    pub envelope: EnvelopePolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            envelope: EnvelopePolicy::default(),
        }
    }
}

/// Global configuration parsed from `pipelink.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Child process launched by the supervisor.
    pub child: ChildCommand,
    /// Readiness and shutdown timing.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Framing and envelope rules.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl GlobalConfig {
    /// Build a configuration with defaults for everything except the child.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the command is empty.
    pub fn for_child(child: ChildCommand) -> Result<Self> {
        let config = Self {
            child,
            timeouts: TimeoutConfig::default(),
            protocol: ProtocolConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.child.command.trim().is_empty() {
            return Err(AppError::Config("child.command must not be empty".into()));
        }

        if self.timeouts.ready_ms == 0 {
            return Err(AppError::Config(
                "timeouts.ready_ms must be greater than zero".into(),
            ));
        }

        if self.protocol.max_line_bytes < MIN_LINE_BYTES {
            return Err(AppError::Config(format!(
                "protocol.max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }

        Ok(())
    }
}
