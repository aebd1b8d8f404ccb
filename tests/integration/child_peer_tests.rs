//! Integration tests for `ChildPeer` over in-memory pipes, playing the
//! supervisor side by hand.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use pipelink::config::ProtocolConfig;
use pipelink::handlers::child_table;
use pipelink::peer::{ChildPeer, PROTOCOL_VERSION};
use pipelink::protocol::handshake::PeerState;
use pipelink::protocol::receiver::LoopExit;
use pipelink::Result;

struct Wire {
    to_child: DuplexStream,
    from_child: Lines<BufReader<DuplexStream>>,
}

impl Wire {
    async fn send(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).expect("serialise");
        line.push(b'\n');
        self.to_child.write_all(&line).await.expect("write");
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.from_child.next_line())
            .await
            .expect("line in time")
            .expect("read ok")
            .expect("child output open");
        serde_json::from_str(&line).expect("json line")
    }
}

fn launch(peer: ChildPeer) -> (Wire, JoinHandle<Result<LoopExit>>) {
    let (to_child, child_in) = tokio::io::duplex(64 * 1024);
    let (child_out, from_child) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(peer.run(child_in, child_out));
    (
        Wire {
            to_child,
            from_child: BufReader::new(from_child).lines(),
        },
        task,
    )
}

/// The child opens with an `init` hello carrying a UUID id and the protocol version.
#[tokio::test]
async fn child_sends_init_hello() {
    let peer = ChildPeer::new(child_table(), ProtocolConfig::default());
    let (mut wire, _task) = launch(peer);

    let hello = wire.recv().await;
    assert_eq!(hello["method"], json!("init"));
    assert_eq!(hello["jsonrpc"], json!("2.0"));
    assert_eq!(hello["params"]["protocol_version"], json!(PROTOCOL_VERSION));
    let id = hello["id"].as_str().expect("string id");
    assert!(uuid::Uuid::parse_str(id).is_ok(), "id is not a uuid: {id}");
}

/// Full session: readiness, a request, then shutdown ends the peer.
#[tokio::test]
async fn full_session() {
    let peer = ChildPeer::new(child_table(), ProtocolConfig::default());
    let handshake = peer.handshake();
    let (mut wire, task) = launch(peer);

    let _hello = wire.recv().await;
    assert_eq!(handshake.state(), PeerState::AwaitingReady);

    wire.send(json!({"type": "server_ready", "id": 1, "supported_types": ["pong"]}))
        .await;
    let ready = wire.recv().await;
    assert_eq!(ready["type"], json!("client_ready"));
    assert_eq!(handshake.state(), PeerState::Ready);

    wire.send(json!({"type": "ping", "id": 2})).await;
    let pong = wire.recv().await;
    assert_eq!(pong["type"], json!("pong"));
    assert_eq!(pong["id"], json!(2));

    wire.send(json!({"type": "shutdown", "id": 3})).await;
    let ack = wire.recv().await;
    assert_eq!(ack["type"], json!("shutdown_ack"));
    assert_eq!(ack["id"], json!(3));

    let exit = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("peer exits in time")
        .expect("join")
        .expect("run ok");
    assert_eq!(exit, LoopExit::ShutdownRequested);
    assert_eq!(handshake.state(), PeerState::Terminated);

    // Output is closed once the peer finishes.
    assert!(wire.from_child.next_line().await.expect("read ok").is_none());
}

/// Closing the child's input ends the peer cleanly.
#[tokio::test]
async fn eof_ends_peer() {
    let peer = ChildPeer::new(child_table(), ProtocolConfig::default());
    let handshake = peer.handshake();
    let (wire, task) = launch(peer);
    drop(wire.to_child);

    let exit = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("peer exits in time")
        .expect("join")
        .expect("run ok");
    assert_eq!(exit, LoopExit::StreamClosed);
    assert_eq!(handshake.state(), PeerState::Terminated);
}

/// The cancellation token stops the peer without further dispatch.
#[tokio::test]
async fn cancel_token_stops_peer() {
    let peer = ChildPeer::new(child_table(), ProtocolConfig::default());
    let cancel = peer.cancel_token();
    let (mut wire, task) = launch(peer);
    let _hello = wire.recv().await;

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("peer exits in time")
        .expect("join")
        .expect("run ok");
    assert_eq!(exit, LoopExit::Cancelled);
}
