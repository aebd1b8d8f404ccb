#![forbid(unsafe_code)]

//! Supervisor and child peer for a line-delimited JSON protocol carried over
//! a child process's stdin and stdout.

pub mod config;
pub mod console;
pub mod errors;
pub mod handlers;
pub mod peer;
pub mod protocol;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
