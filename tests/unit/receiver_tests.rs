//! Unit tests for the receive loop, driven over in-memory duplex pipes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pipelink::config::EnvelopePolicy;
use pipelink::handlers::{self, child_table};
use pipelink::protocol::handshake::{Handshake, PeerState, Role};
use pipelink::protocol::receiver::{LoopExit, ReceiveLoop};
use pipelink::protocol::message::Message;
use pipelink::protocol::router::{Dispatch, HandlerTable};
use pipelink::protocol::sender::OutboundSender;
use pipelink::{AppError, Result};

struct Harness {
    input: Option<DuplexStream>,
    output: Lines<BufReader<DuplexStream>>,
    handshake: Arc<Handshake>,
    cancel: CancellationToken,
    task: JoinHandle<LoopExit>,
}

impl Harness {
    fn spawn(table: HandlerTable, envelope: EnvelopePolicy) -> Self {
        Self::spawn_with_cancel(table, envelope, CancellationToken::new())
    }

    fn spawn_with_cancel(
        table: HandlerTable,
        envelope: EnvelopePolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (input, loop_in) = tokio::io::duplex(64 * 1024);
        let (loop_out, output) = tokio::io::duplex(64 * 1024);

        let handshake = Arc::new(Handshake::new(Role::Child));
        handshake.connected();

        let receive_loop = ReceiveLoop::new(
            table,
            OutboundSender::new("child", loop_out),
            Arc::clone(&handshake),
            cancel.clone(),
        )
        .with_envelope_policy(envelope)
        .with_max_line_bytes(256);

        Self {
            input: Some(input),
            output: BufReader::new(output).lines(),
            handshake,
            cancel,
            task: tokio::spawn(receive_loop.run(loop_in)),
        }
    }

    fn child() -> Self {
        Self::spawn(child_table(), EnvelopePolicy::FirstOnly)
    }

    async fn write(&mut self, line: &str) {
        self.input
            .as_mut()
            .expect("input open")
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write to loop");
    }

    fn close_input(&mut self) {
        self.input = None;
    }

    async fn read(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.output.next_line())
            .await
            .expect("reply in time")
            .expect("read ok")
            .expect("output open");
        serde_json::from_str(&line).expect("reply is json")
    }

    async fn finish(self) -> (LoopExit, PeerState) {
        let exit = tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("loop exits in time")
            .expect("loop task joins");
        (exit, self.handshake.state())
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

/// `calculate` with id 5 is answered on the output stream with the same id.
#[tokio::test]
async fn calculate_round_trip() {
    let mut h = Harness::child();
    h.write(r#"{"type":"calculate","id":5,"expression":"2+3*4"}"#).await;

    assert_eq!(
        h.read().await,
        json!({"type": "calculation_result", "id": 5, "expression": "2+3*4", "result": 14})
    );
}

/// A reply to a request without an id receives the sender's next id.
#[tokio::test]
async fn reply_without_request_id_is_stamped() {
    let mut h = Harness::child();
    h.write(r#"{"type":"ping"}"#).await;
    let reply = h.read().await;
    assert_eq!(reply["type"], json!("pong"));
    assert_eq!(reply["id"], json!(1));
}

/// A calculation error is a reply, and the loop keeps serving.
#[tokio::test]
async fn calculation_error_does_not_stop_loop() {
    let mut h = Harness::child();
    h.write(r#"{"type":"calculate","id":1,"expression":"10/0"}"#).await;
    h.write(r#"{"type":"ping","id":2}"#).await;

    assert_eq!(h.read().await["type"], json!("calculation_error"));
    assert_eq!(h.read().await["type"], json!("pong"));
    assert!(!h.task.is_finished());
}

/// Blank, malformed, oversized, unroutable and unknown lines are all skipped.
#[tokio::test]
async fn bad_lines_are_skipped() {
    let mut h = Harness::child();
    h.write("").await;
    h.write("{not json").await;
    h.write(&format!(r#"{{"type":"echo","message":"{}"}}"#, "x".repeat(400))).await;
    h.write(r#"{"payload":1}"#).await;
    h.write("17").await;
    h.write(r#"{"type":"no_such_type","id":9}"#).await;
    h.write(r#"{"type":"error","message":"peer diagnostic"}"#).await;
    h.write(r#"{"type":"ping","id":10}"#).await;

    let reply = h.read().await;
    assert_eq!(reply["type"], json!("pong"));
    assert_eq!(reply["id"], json!(10));
    assert_eq!(h.handshake.state(), PeerState::AwaitingReady);
}

/// `method` routes when `type` is absent.
#[tokio::test]
async fn method_field_routes() {
    let mut h = Harness::child();
    h.write(r#"{"method":"ping","id":"m-1"}"#).await;
    assert_eq!(h.read().await["id"], json!("m-1"));
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// A single-element array envelope behaves exactly like the bare object.
#[tokio::test]
async fn array_envelope_matches_bare_message() {
    let mut h = Harness::child();
    h.write(r#"{"type":"echo","id":1,"message":"hi"}"#).await;
    h.write(r#"[{"type":"echo","id":1,"message":"hi"}]"#).await;

    let bare = h.read().await;
    let wrapped = h.read().await;
    assert_eq!(bare, wrapped);
}

/// By default only the first element of a larger array is routed.
#[tokio::test]
async fn first_only_drops_later_elements() {
    let mut h = Harness::child();
    h.write(r#"[{"type":"ping","id":1},{"type":"ping","id":2}]"#).await;
    h.write(r#"{"type":"ping","id":3}"#).await;

    assert_eq!(h.read().await["id"], json!(1));
    assert_eq!(h.read().await["id"], json!(3));
}

#[tokio::test]
async fn each_element_routes_every_object() {
    let mut h = Harness::spawn(child_table(), EnvelopePolicy::EachElement);
    h.write(r#"[{"type":"ping","id":1},"junk",{"type":"ping","id":2}]"#).await;

    assert_eq!(h.read().await["id"], json!(1));
    assert_eq!(h.read().await["id"], json!(2));
}

#[tokio::test]
async fn empty_array_is_ignored() {
    let mut h = Harness::child();
    h.write("[]").await;
    h.write(r#"{"type":"ping","id":4}"#).await;
    assert_eq!(h.read().await["id"], json!(4));
}

// ── Handshake and shutdown ────────────────────────────────────────────────────

/// `server_ready` makes the child ready and is answered with `client_ready`.
#[tokio::test]
async fn readiness_is_answered() {
    let mut h = Harness::child();
    h.write(r#"{"type":"server_ready","supported_types":["ping","pong"]}"#).await;

    let reply = h.read().await;
    assert_eq!(reply["type"], json!("client_ready"));
    assert_eq!(
        reply["capabilities"],
        json!(["ping", "echo", "calculate", "shutdown"])
    );
    assert_eq!(h.handshake.state(), PeerState::Ready);
    assert_eq!(
        h.handshake.advertised_keys(),
        Some(vec!["ping".to_owned(), "pong".to_owned()])
    );
}

/// `shutdown` is acknowledged, then the loop exits without reading further.
#[tokio::test]
async fn shutdown_acks_and_stops() {
    let mut h = Harness::child();
    h.write(r#"{"type":"shutdown","id":6}"#).await;
    h.write(r#"{"type":"ping","id":7}"#).await;

    let ack = h.read().await;
    assert_eq!(ack["type"], json!("shutdown_ack"));
    assert_eq!(ack["id"], json!(6));

    let (exit, state) = h.finish().await;
    assert_eq!(exit, LoopExit::ShutdownRequested);
    assert_eq!(state, PeerState::ShuttingDown);
}

/// With no `shutdown` handler registered, `shutdown` still ends the loop.
#[tokio::test]
async fn unrouted_shutdown_stops_loop() {
    let table = HandlerTable::builder().route("ping", handlers::ping).build();
    let mut h = Harness::spawn(table, EnvelopePolicy::FirstOnly);
    h.write(r#"{"type":"shutdown"}"#).await;

    let (exit, _) = h.finish().await;
    assert_eq!(exit, LoopExit::ShutdownRequested);
}

/// EOF ends the loop and terminates the peer.
#[tokio::test]
async fn eof_terminates_peer() {
    let mut h = Harness::child();
    h.close_input();

    let (exit, state) = h.finish().await;
    assert_eq!(exit, LoopExit::StreamClosed);
    assert_eq!(state, PeerState::Terminated);
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// A line that arrives after cancellation is never dispatched.
#[tokio::test]
async fn no_dispatch_after_cancel() {
    let mut h = Harness::child();
    h.cancel.cancel();
    h.write(r#"{"type":"ping","id":1}"#).await;

    let Harness { mut output, task, .. } = h;
    let exit = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("loop exits in time")
        .expect("join");
    assert_eq!(exit, LoopExit::Cancelled);

    // The loop owned the only sender, so its output is now closed and empty.
    let next = output.next_line().await.expect("read ok");
    assert!(next.is_none(), "unexpected reply after cancel: {next:?}");
}

/// Table whose `halt` handler clears the running flag mid-stream.
fn halting_table(cancel: &CancellationToken) -> HandlerTable {
    let token = cancel.clone();
    HandlerTable::builder()
        .route("ping", handlers::ping)
        .route("halt", move |_: &Message, _: &mut Dispatch| -> Result<()> {
            token.cancel();
            Ok(())
        })
        .build()
}

async fn assert_cancelled_silently(h: Harness) {
    let Harness { mut output, task, .. } = h;
    let exit = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("loop exits in time")
        .expect("join");
    assert_eq!(exit, LoopExit::Cancelled);

    let next = output.next_line().await.expect("read ok");
    assert!(next.is_none(), "line dispatched after cancel: {next:?}");
}

/// Two lines delivered in one write: the first clears the running flag, and
/// the already-buffered second line is never dispatched.
#[tokio::test]
async fn buffered_line_not_dispatched_after_cancel() {
    let cancel = CancellationToken::new();
    let mut h = Harness::spawn_with_cancel(
        halting_table(&cancel),
        EnvelopePolicy::FirstOnly,
        cancel,
    );
    h.input
        .as_mut()
        .expect("input open")
        .write_all(b"{\"type\":\"halt\"}\n{\"type\":\"ping\",\"id\":2}\n")
        .await
        .expect("write to loop");

    assert_cancelled_silently(h).await;
}

/// Later elements of an array envelope are not routed once the flag clears.
#[tokio::test]
async fn envelope_elements_not_dispatched_after_cancel() {
    let cancel = CancellationToken::new();
    let mut h = Harness::spawn_with_cancel(
        halting_table(&cancel),
        EnvelopePolicy::EachElement,
        cancel,
    );
    h.write(r#"[{"type":"halt"},{"type":"ping","id":3}]"#).await;

    assert_cancelled_silently(h).await;
}

// ── Handler faults ────────────────────────────────────────────────────────────

fn failing(_: &Message, _: &mut Dispatch) -> Result<()> {
    Err(AppError::Handler("boom".into()))
}

fn panicking(_: &Message, _: &mut Dispatch) -> Result<()> {
    panic!("handler exploded");
}

/// A handler error ends the loop and terminates the peer.
#[tokio::test]
async fn handler_error_terminates() {
    let table = HandlerTable::builder().route("boom", failing).build();
    let mut h = Harness::spawn(table, EnvelopePolicy::FirstOnly);
    h.write(r#"{"type":"boom"}"#).await;

    let (exit, state) = h.finish().await;
    assert!(
        matches!(&exit, LoopExit::HandlerFailed(reason) if reason.contains("boom")),
        "unexpected exit: {exit:?}"
    );
    assert_eq!(state, PeerState::Terminated);
}

/// A panicking handler is contained and treated like an error.
#[tokio::test]
async fn handler_panic_terminates() {
    let table = HandlerTable::builder().route("boom", panicking).build();
    let mut h = Harness::spawn(table, EnvelopePolicy::FirstOnly);
    h.write(r#"{"type":"boom"}"#).await;

    let (exit, state) = h.finish().await;
    assert!(
        matches!(&exit, LoopExit::HandlerFailed(reason) if reason.contains("handler exploded")),
        "unexpected exit: {exit:?}"
    );
    assert_eq!(state, PeerState::Terminated);
}
