//! Integration tests for stop escalation against children that ignore the
//! protocol entirely.

#![cfg(unix)]

use std::time::{Duration, Instant};

use pipelink::config::{ChildCommand, ProtocolConfig, TimeoutConfig};
use pipelink::handlers::supervisor_table;
use pipelink::protocol::handshake::PeerState;
use pipelink::supervisor::{Escalation, ProcessSupervisor};
use pipelink::AppError;

fn supervisor(terminate_ms: u64) -> ProcessSupervisor {
    ProcessSupervisor::new(
        supervisor_table(None),
        TimeoutConfig {
            ready_ms: 200,
            grace_ms: 200,
            terminate_ms,
        },
        ProtocolConfig::default(),
    )
}

/// A child that never answers times out waiting for readiness, then is
/// stopped with a single termination signal.
#[tokio::test]
async fn silent_child_is_terminated() {
    let mut supervisor = supervisor(2_000);
    supervisor
        .start(&ChildCommand::new("sleep", vec!["30".into()]))
        .await
        .expect("start");

    let err = supervisor
        .wait_ready(Duration::from_millis(200))
        .await
        .expect_err("never ready");
    assert!(matches!(err, AppError::Timeout(_)), "unexpected error: {err}");
    assert_eq!(supervisor.state(), PeerState::AwaitingReady);

    let started = Instant::now();
    let report = supervisor
        .stop(Duration::from_millis(200))
        .await
        .expect("stop")
        .expect("report");

    assert!(!report.graceful);
    assert_eq!(report.escalation, Escalation::Terminate);
    assert_eq!(report.exit_code, None, "killed by signal, no exit code");
    assert_eq!(supervisor.state(), PeerState::Terminated);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(supervisor.stop(Duration::from_millis(200)).await.expect("second stop").is_none());
}

/// A child that ignores the termination signal is force-killed.
#[tokio::test]
async fn stubborn_child_is_killed() {
    let mut supervisor = supervisor(200);
    supervisor
        .start(&ChildCommand::new(
            "sh",
            vec!["-c".into(), "trap '' TERM; exec sleep 30".into()],
        ))
        .await
        .expect("start");

    let report = supervisor
        .stop(Duration::from_millis(200))
        .await
        .expect("stop")
        .expect("report");

    assert!(!report.graceful);
    assert_eq!(report.escalation, Escalation::Kill);
    assert_eq!(supervisor.state(), PeerState::Terminated);
}

/// Extra environment from the command is passed alongside the launch markers.
#[tokio::test]
async fn child_sees_launch_markers() {
    let mut command = ChildCommand::new(
        "sh",
        vec![
            "-c".into(),
            r#"test "$PIPELINK_LAUNCHED" = 1 && test -n "$PIPELINK_SUPERVISOR_PID" && test "$EXTRA" = yes"#
                .into(),
        ],
    );
    command.env.insert("EXTRA".into(), "yes".into());

    let mut supervisor = supervisor(200);
    // The script may exit before `server_ready` is written.
    let _ = supervisor.start(&command).await;

    let report = supervisor
        .stop(Duration::from_secs(5))
        .await
        .expect("stop")
        .expect("report");
    assert_eq!(report.exit_code, Some(0));
}

/// A late `shutdown_ack` does not earn the child a second full grace period:
/// the exit wait only gets what is left of the first one.
#[tokio::test]
async fn late_ack_shares_one_grace_period() {
    let mut supervisor = supervisor(2_000);
    supervisor
        .start(&ChildCommand::new(
            "sh",
            vec![
                "-c".into(),
                r#"read l; echo '{"type":"client_ready"}'; read s; sleep 1; echo '{"type":"shutdown_ack"}'; exec sleep 30"#
                    .into(),
            ],
        ))
        .await
        .expect("start");
    supervisor
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("ready");

    let started = Instant::now();
    let report = supervisor
        .stop(Duration::from_millis(1_500))
        .await
        .expect("stop")
        .expect("report");
    let elapsed = started.elapsed();

    assert!(report.graceful);
    assert_eq!(report.escalation, Escalation::Terminate);
    assert!(
        elapsed < Duration::from_millis(2_200),
        "stop took {elapsed:?}, longer than one grace period plus slack"
    );
}
