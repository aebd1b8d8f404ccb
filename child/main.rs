#![forbid(unsafe_code)]

//! `pipelink-child` child peer binary.
//!
//! Speaks the protocol on its own stdin and stdout. Stdout carries protocol
//! lines only; every log line goes to stderr, which the supervisor relays.

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use pipelink::config::{EnvelopePolicy, ProtocolConfig};
use pipelink::handlers::child_table;
use pipelink::peer::{ChildPeer, LaunchInfo};
use pipelink::protocol::receiver::LoopExit;
use pipelink::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pipelink-child", about = "Child peer for the pipelink stdio protocol", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Route every element of an array envelope instead of only the first.
    #[arg(long)]
    each_element: bool,

    /// Longest accepted inbound line in bytes.
    #[arg(long, default_value_t = pipelink::protocol::codec::MAX_LINE_BYTES)]
    max_line_bytes: usize,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let launch = LaunchInfo::from_env();
    if launch.launched_by_supervisor {
        info!(supervisor_pid = ?launch.supervisor_pid, "launched by supervisor");
    } else {
        info!("running standalone");
    }

    let protocol = ProtocolConfig {
        max_line_bytes: args.max_line_bytes,
        envelope: if args.each_element {
            EnvelopePolicy::EachElement
        } else {
            EnvelopePolicy::FirstOnly
        },
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    let exit = runtime.block_on(
        ChildPeer::new(child_table(), protocol).run(tokio::io::stdin(), tokio::io::stdout()),
    );
    // A pending stdin read would otherwise hold shutdown open.
    runtime.shutdown_background();

    match exit? {
        LoopExit::HandlerFailed(reason) => {
            error!(reason = reason.as_str(), "handler fault, exiting");
            Err(AppError::Handler(reason))
        }
        LoopExit::IoFailed(reason) => {
            error!(reason = reason.as_str(), "input stream failed, exiting");
            Err(AppError::Transport(reason))
        }
        exit @ (LoopExit::StreamClosed | LoopExit::Cancelled | LoopExit::ShutdownRequested) => {
            info!(?exit, "child exiting");
            Ok(())
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
