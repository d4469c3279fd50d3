//! Integration tests for sub-protocol multiplexing over real TCP nodes.
//!
//! Two `PeerNode`s are started on loopback with different protocol sets,
//! connected, and observed through recording session handlers.
//!
//! No external services are contacted; everything runs in-process.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_types::{Capability, NodeConfig, NodeId};
use tandem_wire::{
    PeerNode, ProtoChannel, Protocol, ProtocolRegistry, RemotePeer, SessionHandler, WireError,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Recording handler: notes which sessions start and what they receive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started { node: String, cap: Capability },
    Received { node: String, cap: Capability, code: u64, body: String },
}

struct Recorder {
    node: String,
    cap: Capability,
    events: mpsc::UnboundedSender<Event>,
    /// Messages to send as soon as the session starts.
    greet: Vec<(u64, &'static str)>,
}

#[async_trait]
impl SessionHandler for Recorder {
    async fn run(&self, _peer: RemotePeer, mut rw: ProtoChannel) -> Result<(), WireError> {
        let _ = self.events.send(Event::Started {
            node: self.node.clone(),
            cap: self.cap.clone(),
        });
        for &(code, body) in &self.greet {
            rw.write_msg(code, Bytes::from_static(body.as_bytes())).await?;
        }
        loop {
            let msg = rw.read_msg().await?;
            let code = msg.code;
            let body = msg.payload.read_to_end();
            let _ = self.events.send(Event::Received {
                node: self.node.clone(),
                cap: self.cap.clone(),
                code,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
    }
}

fn recorder(
    node: &str,
    name: &str,
    version: u32,
    length: u64,
    greet: Vec<(u64, &'static str)>,
    events: &mpsc::UnboundedSender<Event>,
) -> Protocol {
    Protocol::new(name, version, length).with_handler(Recorder {
        node: node.to_string(),
        cap: Capability::new(name, version),
        events: events.clone(),
        greet,
    })
}

async fn drain(_peer: RemotePeer, mut rw: ProtoChannel) -> Result<(), WireError> {
    loop {
        rw.read_msg().await?.discard();
    }
}

fn config(id: &str) -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        node_id: NodeId::from(id),
        node_name: id.to_string(),
        session_shutdown_grace_ms: 200,
        ..NodeConfig::default()
    }
}

fn registry(protocols: Vec<Protocol>) -> ProtocolRegistry {
    let registry = ProtocolRegistry::new();
    for proto in protocols {
        registry.register(proto).unwrap();
    }
    registry
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn collect(events: &mut mpsc::UnboundedReceiver<Event>, count: usize) -> Vec<Event> {
    let mut got = Vec::new();
    while got.len() < count {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event not received")
            .expect("event channel closed");
        got.push(event);
    }
    got
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_only_highest_shared_version_runs() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = registry(vec![
        recorder("A", "abc", 1, 2, vec![], &tx),
        recorder("A", "xyz", 3, 2, vec![], &tx),
    ]);
    let b = registry(vec![
        recorder("B", "abc", 1, 2, vec![], &tx),
        recorder("B", "abc", 2, 2, vec![], &tx),
    ]);

    let (node_a, _ta) = PeerNode::start(config("A"), a).await.unwrap();
    let (node_b, _tb) = PeerNode::start(config("B"), b).await.unwrap();
    let remote = node_a.connect(node_b.local_addr()).await.unwrap();
    assert_eq!(remote.running_caps(), vec![Capability::new("abc", 1)]);

    let mut started = collect(&mut rx, 2).await;
    started.sort_by_key(|e| format!("{e:?}"));
    assert_eq!(
        started,
        vec![
            Event::Started {
                node: "A".into(),
                cap: Capability::new("abc", 1)
            },
            Event::Started {
                node: "B".into(),
                cap: Capability::new("abc", 1)
            },
        ]
    );
    // Nothing else starts.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    node_a.shutdown();
    node_b.shutdown();
}

#[tokio::test]
async fn test_concurrent_protocols_keep_their_codes() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = registry(vec![
        recorder("A", "chat", 1, 3, vec![(2, "hello"), (0, "again")], &tx),
        recorder("A", "sync", 1, 5, vec![(4, "block")], &tx),
    ]);
    let b = registry(vec![
        recorder("B", "chat", 1, 3, vec![], &tx),
        recorder("B", "sync", 1, 5, vec![], &tx),
    ]);

    let (node_a, _ta) = PeerNode::start(config("A"), a).await.unwrap();
    let (node_b, _tb) = PeerNode::start(config("B"), b).await.unwrap();
    node_b.connect(node_a.local_addr()).await.unwrap();

    // Four session starts plus three deliveries at B.
    let events = collect(&mut rx, 7).await;
    let received: Vec<(Capability, u64, String)> = events
        .into_iter()
        .filter_map(|e| match e {
            Event::Received {
                node,
                cap,
                code,
                body,
            } => {
                assert_eq!(node, "B");
                Some((cap, code, body))
            }
            Event::Started { .. } => None,
        })
        .collect();

    // Per-protocol order is preserved; codes come back protocol-relative.
    let chat: Vec<_> = received
        .iter()
        .filter(|r| r.0.name == "chat")
        .map(|r| (r.1, r.2.as_str()))
        .collect();
    assert_eq!(chat, vec![(2, "hello"), (0, "again")]);
    let sync: Vec<_> = received
        .iter()
        .filter(|r| r.0.name == "sync")
        .map(|r| (r.1, r.2.as_str()))
        .collect();
    assert_eq!(sync, vec![(4, "block")]);

    node_a.shutdown();
    node_b.shutdown();
}

#[derive(Debug, Serialize, Deserialize)]
struct Status {
    head: u64,
}

#[tokio::test]
async fn test_failing_session_drops_connection_on_both_sides() {
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    let checker = move |_peer: RemotePeer, mut rw: ProtoChannel| {
        let failed_tx = failed_tx.clone();
        async move {
            let mut status: Status = rw.read_msg().await?.decode()?;
            while status.head <= 1 {
                status = rw.read_msg().await?.decode()?;
            }
            let _ = failed_tx.send(status.head);
            Err::<(), WireError>(WireError::Protocol(format!("head {} too far", status.head)))
        }
    };
    let sender = |_peer: RemotePeer, rw: ProtoChannel| async move {
        rw.send(0, &Status { head: 1 }).await?;
        rw.send(0, &Status { head: 7 }).await?;
        std::future::pending::<()>().await;
        Ok::<(), WireError>(())
    };

    let (node_a, _ta) = PeerNode::start(
        config("A"),
        registry(vec![Protocol::new("eth", 1, 1).with_handler(checker)]),
    )
    .await
    .unwrap();
    let (node_b, _tb) = PeerNode::start(
        config("B"),
        registry(vec![Protocol::new("eth", 1, 1).with_handler(sender)]),
    )
    .await
    .unwrap();

    node_b.connect(node_a.local_addr()).await.unwrap();

    // A's session rejects the second status; both ends drop the peer.
    let head = tokio::time::timeout(WAIT, failed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head, 7);
    wait_until(|| node_a.registry().connected_count() == 0).await;
    wait_until(|| node_b.registry().connected_count() == 0).await;

    node_a.shutdown();
    node_b.shutdown();
}

#[tokio::test]
async fn test_peer_and_node_info() {
    let counter = Arc::new(Mutex::new(0u64));
    let seen = Arc::clone(&counter);
    let proto = || {
        let seen = Arc::clone(&seen);
        Protocol::new("abc", 1, 1)
            .with_handler(drain)
            .with_node_info(move || serde_json::json!({ "queries": *seen.lock().unwrap() }))
            .with_peer_info(|id| Some(serde_json::json!({ "id": id.as_str() })))
    };

    let (node_a, _ta) = PeerNode::start(config("A"), registry(vec![proto()]))
        .await
        .unwrap();
    let (node_b, _tb) = PeerNode::start(config("B"), registry(vec![proto()]))
        .await
        .unwrap();
    node_a.connect(node_b.local_addr()).await.unwrap();

    *counter.lock().unwrap() = 3;
    let info = node_a.node_info();
    assert_eq!(info["protocols"]["abc/1"]["queries"], 3);
    assert_eq!(info["peers"], 1);

    let peers = node_a.peer_infos();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id.as_str(), "B");
    assert_eq!(peers[0].protocols["abc"]["id"], "B");
    assert_eq!(peers[0].caps, vec!["abc/1"]);

    let rendered = serde_json::to_value(&peers[0]).unwrap();
    assert_eq!(rendered["name"], "B");

    node_a.shutdown();
    node_b.shutdown();
}
