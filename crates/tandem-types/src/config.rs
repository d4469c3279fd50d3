//! Node configuration.
//!
//! Every field has a default so a partial (or empty) TOML file is valid.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a multiplexing peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This node's unique ID.
    pub node_id: NodeId,
    /// Human-readable node name, sent in the hello handshake.
    pub node_name: String,
    /// Maximum number of simultaneously connected peers.
    pub max_peers: usize,
    /// Time allowed for the hello exchange on a fresh connection.
    pub handshake_timeout_ms: u64,
    /// Interval between keepalive pings on an idle connection.
    pub ping_interval_ms: u64,
    /// A connection that receives nothing for this long is dropped.
    pub frame_read_timeout_ms: u64,
    /// Time sibling sessions get to return after the connection starts closing.
    pub session_shutdown_grace_ms: u64,
    /// Addresses dialed once at startup.
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: NodeId::random(),
            node_name: "tandem-node".to_string(),
            max_peers: 50,
            handshake_timeout_ms: 5_000,
            ping_interval_ms: 15_000,
            frame_read_timeout_ms: 30_000,
            session_shutdown_grace_ms: 1_000,
            bootstrap: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn frame_read_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_read_timeout_ms)
    }

    pub fn session_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.session_shutdown_grace_ms)
    }
}
