//! Built-in `echo/1` protocol.
//!
//! Each side greets the other once when the session starts and answers every
//! request by sending the payload back. Useful for checking that two nodes
//! can reach each other and negotiate.

use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_wire::{ProtoChannel, Protocol, RemotePeer, WireError};
use tracing::info;

pub const NAME: &str = "echo";
pub const VERSION: u32 = 1;
pub const LENGTH: u64 = 2;

const REQUEST: u64 = 0;
const REPLY: u64 = 1;

#[derive(Debug, Default)]
struct EchoStats {
    sent: AtomicU64,
    answered: AtomicU64,
    replies: AtomicU64,
}

impl EchoStats {
    fn snapshot(&self) -> Value {
        json!({
            "sent": self.sent.load(Ordering::Relaxed),
            "answered": self.answered.load(Ordering::Relaxed),
            "replies": self.replies.load(Ordering::Relaxed),
        })
    }
}

/// The echo protocol descriptor, greeting peers as `node_name`.
pub fn protocol(node_name: &str) -> Protocol {
    let stats = Arc::new(EchoStats::default());
    let greeting = Bytes::from(format!("hello from {node_name}"));
    let session_stats = Arc::clone(&stats);
    Protocol::new(NAME, VERSION, LENGTH)
        .with_handler(move |peer: RemotePeer, rw: ProtoChannel| {
            run_session(peer, rw, greeting.clone(), Arc::clone(&session_stats))
        })
        .with_node_info(move || stats.snapshot())
}

async fn run_session(
    peer: RemotePeer,
    mut rw: ProtoChannel,
    greeting: Bytes,
    stats: Arc<EchoStats>,
) -> Result<(), WireError> {
    rw.write_msg(REQUEST, greeting).await?;
    stats.sent.fetch_add(1, Ordering::Relaxed);

    loop {
        let msg = rw.read_msg().await?;
        match msg.code {
            REQUEST => {
                let body = msg.payload.read_to_end();
                rw.write_msg(REPLY, body).await?;
                stats.answered.fetch_add(1, Ordering::Relaxed);
            }
            REPLY => {
                let body = msg.payload.read_to_end();
                stats.replies.fetch_add(1, Ordering::Relaxed);
                info!(
                    peer = %peer.id(),
                    reply = %String::from_utf8_lossy(&body),
                    "Echo reply"
                );
            }
            other => {
                msg.discard();
                return Err(WireError::Protocol(format!("unexpected echo message {other}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tandem_types::{NodeConfig, NodeId};
    use tandem_wire::{PeerNode, ProtocolRegistry};

    fn config(id: &str) -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: NodeId::from(id),
            node_name: id.to_string(),
            ..NodeConfig::default()
        }
    }

    async fn start(id: &str) -> std::sync::Arc<PeerNode> {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(id)).unwrap();
        let (node, _task) = PeerNode::start(config(id), registry).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_nodes_echo_each_other() {
        let a = start("a").await;
        let b = start("b").await;
        a.connect(b.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (ia, ib) = (a.node_info(), b.node_info());
                if ia["protocols"]["echo/1"]["replies"] == 1
                    && ib["protocols"]["echo/1"]["replies"] == 1
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("echo replies not received");

        let info = a.node_info();
        assert_eq!(info["protocols"]["echo/1"]["sent"], 1);
        assert_eq!(info["protocols"]["echo/1"]["answered"], 1);

        a.shutdown();
        b.shutdown();
    }
}
