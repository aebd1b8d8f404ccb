//! Operator console commands for the `pipelink` binary.
//!
//! One command per line:
//!
//! | Input           | Effect                                   |
//! |-----------------|------------------------------------------|
//! | `ping`          | send `ping` with the current timestamp   |
//! | `echo <text>`   | send `echo`                              |
//! | `calc <expr>`   | send `calculate`                         |
//! | `shutdown`      | shut the child down and exit             |
//! | `quit`          | same as `shutdown`                       |

use std::fmt;

use serde_json::{json, Value};

use crate::protocol::message::keys;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Liveness check.
    Ping,
    /// Echo the given text.
    Echo(String),
    /// Evaluate the given expression.
    Calc(String),
    /// Shut the child down.
    Shutdown,
    /// Leave the console; also shuts the child down.
    Quit,
}

/// Why a console line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The line was blank.
    Empty,
    /// `echo` or `calc` without an argument.
    MissingArgument(&'static str),
    /// Anything else.
    Unknown(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty command"),
            Self::MissingArgument(cmd) => write!(f, "`{cmd}` needs an argument"),
            Self::Unknown(input) => write!(
                f,
                "unknown command `{input}`; use ping, echo <text>, calc <expr>, shutdown, quit"
            ),
        }
    }
}

impl std::error::Error for CommandError {}

impl OperatorCommand {
    /// Parse one console line. Command words are case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] for blank, incomplete, or unknown input.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "ping" if rest.is_empty() => Ok(Self::Ping),
            "shutdown" if rest.is_empty() => Ok(Self::Shutdown),
            "quit" if rest.is_empty() => Ok(Self::Quit),
            "echo" if rest.is_empty() => Err(CommandError::MissingArgument("echo")),
            "echo" => Ok(Self::Echo(rest.to_owned())),
            "calc" if rest.is_empty() => Err(CommandError::MissingArgument("calc")),
            "calc" => Ok(Self::Calc(rest.to_owned())),
            _ => Err(CommandError::Unknown(line.to_owned())),
        }
    }

    /// The protocol message this command sends, if any.
    ///
    /// `shutdown` and `quit` go through the supervisor's stop sequence
    /// instead of a raw send.
    #[must_use]
    pub fn to_message(&self, timestamp: f64) -> Option<Value> {
        match self {
            Self::Ping => Some(json!({ "type": keys::PING, "timestamp": timestamp })),
            Self::Echo(text) => Some(json!({ "type": keys::ECHO, "message": text })),
            Self::Calc(expr) => Some(json!({ "type": keys::CALCULATE, "expression": expr })),
            Self::Shutdown | Self::Quit => None,
        }
    }
}
