#![forbid(unsafe_code)]

//! `pipelink` supervisor binary.
//!
//! Spawns the child peer, completes the readiness handshake, then relays
//! operator commands from stdin to the child and prints the child's replies
//! to stdout. Logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pipelink::config::{ChildCommand, GlobalConfig};
use pipelink::console::OperatorCommand;
use pipelink::handlers::{self, supervisor_table};
use pipelink::protocol::handshake::PeerState;
use pipelink::protocol::message::Message;
use pipelink::supervisor::ProcessSupervisor;
use pipelink::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pipelink", about = "Supervise a child over a stdio JSON protocol", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the shutdown grace period in milliseconds.
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Child command and arguments; overrides `child` from the config file.
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("pipelink supervisor bootstrap");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let outcome = runtime.block_on(run(args));
    // The console's stdin read may still be parked on the blocking pool.
    runtime.shutdown_background();
    outcome
}

async fn run(args: Cli) -> Result<()> {
    let config = resolve_config(&args)?;
    info!(command = config.child.command.as_str(), "configuration loaded");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(
        supervisor_table(Some(inbound_tx)),
        config.timeouts.clone(),
        config.protocol.clone(),
    );

    supervisor.start(&config.child).await.map_err(|err| {
        error!(%err, "failed to start child");
        err
    })?;

    let printer = tokio::spawn(print_replies(inbound_rx));

    let outcome = match supervisor.wait_ready(config.timeouts.ready()).await {
        Ok(()) => {
            info!(advertised = ?supervisor.advertised_keys(), "child connected, accepting commands");
            operator_loop(&supervisor).await
        }
        Err(err) => {
            error!(%err, "child did not become ready");
            Err(err)
        }
    };

    let report = supervisor.stop(config.timeouts.grace()).await?;
    // Dropping the supervisor drops the last inbound sender, so the printer
    // drains what is queued and ends.
    drop(supervisor);
    if let Err(err) = printer.await {
        warn!(%err, "reply printer failed");
    }

    if let Some(report) = &report {
        if report.exit_code.is_some_and(|code| code != 0) {
            warn!(?report, "child exited with a failure code");
        }
    }
    info!("pipelink shut down");
    outcome
}

fn resolve_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = match (&args.config, args.command.split_first()) {
        (Some(path), _) => GlobalConfig::load_from_path(path)?,
        (None, Some((program, rest))) => {
            GlobalConfig::for_child(ChildCommand::new(program.clone(), rest.to_vec()))?
        }
        (None, None) => GlobalConfig::for_child(ChildCommand::new(default_child()?, Vec::new()))?,
    };

    if args.config.is_some() {
        if let Some((program, rest)) = args.command.split_first() {
            config.child.command.clone_from(program);
            config.child.args = rest.to_vec();
        }
    }
    if let Some(grace_ms) = args.grace_ms {
        config.timeouts.grace_ms = grace_ms;
    }
    Ok(config)
}

/// The `pipelink-child` binary installed next to this one.
fn default_child() -> Result<String> {
    let exe = std::env::current_exe()
        .map_err(|err| AppError::Config(format!("cannot locate own executable: {err}")))?;
    let child = exe.with_file_name(format!("pipelink-child{}", std::env::consts::EXE_SUFFIX));
    Ok(child.to_string_lossy().into_owned())
}

async fn operator_loop(supervisor: &ProcessSupervisor) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = supervisor
        .subscribe()
        .ok_or_else(|| AppError::Process("supervisor not started".into()))?;

    println!("commands: ping | echo <text> | calc <expr> | shutdown | quit");

    loop {
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                return Ok(());
            }
            changed = state.wait_for(|s| matches!(s, PeerState::ShuttingDown | PeerState::Terminated)) => {
                if let Ok(reached) = changed {
                    let reached = *reached;
                    warn!(state = %reached, "child is going away, leaving console");
                }
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("operator input closed");
                    return Ok(());
                };
                let command = match OperatorCommand::parse(&line) {
                    Ok(command) => command,
                    Err(pipelink::console::CommandError::Empty) => continue,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };
                let Some(message) = command.to_message(handlers::unix_timestamp()) else {
                    return Ok(());
                };
                warn_if_not_advertised(supervisor, &message);
                if let Err(err) = supervisor.send(message).await {
                    error!(%err, "failed to send to child");
                    return Err(err);
                }
            }
        }
    }
}

fn warn_if_not_advertised(supervisor: &ProcessSupervisor, message: &serde_json::Value) {
    let key = message.get("type").and_then(serde_json::Value::as_str);
    if let (Some(key), Some(advertised)) = (key, supervisor.advertised_keys()) {
        if !advertised.iter().any(|k| k == key) {
            warn!(routing_key = key, "child did not advertise this message type");
        }
    }
}

async fn print_replies(mut inbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = inbound.recv().await {
        println!("{}", message.into_value());
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

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
