//! Peer registry: tracks live connections by node ID.
//!
//! The [`PeerRegistry`] is a thread-safe map that records every remote peer
//! whose connection is currently running, together with the direction it was
//! established in. Admission checks (duplicate node, peer limit) happen under
//! the same write lock as the insert.

use crate::error::DisconnectReason;
use crate::peer::{PeerInfo, RemotePeer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tandem_types::NodeId;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A single live peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Handle to the running connection.
    pub remote: RemotePeer,
    pub direction: Direction,
}

impl PeerEntry {
    pub fn new(remote: RemotePeer, direction: Direction) -> Self {
        Self { remote, direction }
    }

    pub fn node_id(&self) -> &NodeId {
        self.remote.id()
    }
}

/// Thread-safe registry of connected peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a peer after a successful handshake.
    ///
    /// Fails with the reason to send the remote when the node is already
    /// connected or `max_peers` live connections exist.
    pub fn try_add(&self, entry: PeerEntry, max_peers: usize) -> Result<(), DisconnectReason> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(entry.node_id()) {
            return Err(DisconnectReason::AlreadyConnected);
        }
        if peers.len() >= max_peers {
            return Err(DisconnectReason::TooManyPeers);
        }
        peers.insert(entry.node_id().clone(), entry);
        Ok(())
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, node_id: &NodeId) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(node_id)
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, node_id: &NodeId) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(node_id)
    }

    /// Get all connected peers.
    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// Diagnostic info for every connected peer, sorted by node ID.
    pub fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .connected_peers()
            .iter()
            .map(|entry| entry.remote.info())
            .collect();
        infos.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        infos
    }

    /// Close every live connection with `reason`.
    pub fn disconnect_all(&self, reason: DisconnectReason) {
        for entry in self.connected_peers() {
            entry.remote.disconnect(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Hello, BASE_PROTOCOL_VERSION};
    use crate::peer::{Peer, PeerTimings};
    use std::time::Duration;

    fn make_peer(node_id: &str) -> PeerEntry {
        let (io, _remote) = tokio::io::duplex(1024);
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            node_id: NodeId::from(node_id),
            node_name: format!("{node_id}-name"),
            caps: vec![],
            listen_port: 0,
        };
        let timings = PeerTimings {
            ping_interval: Duration::from_secs(60),
            frame_read_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(100),
        };
        let peer = Peer::new(io, hello, vec![], None, timings);
        PeerEntry::new(peer.remote().clone(), Direction::Inbound)
    }

    #[tokio::test]
    async fn test_add_and_get_peer() {
        let registry = PeerRegistry::new();
        registry.try_add(make_peer("node-1"), 10).unwrap();

        let retrieved = registry.get_peer(&NodeId::from("node-1")).unwrap();
        assert_eq!(retrieved.node_id().as_str(), "node-1");
        assert_eq!(retrieved.remote.name(), "node-1-name");
        assert_eq!(retrieved.direction, Direction::Inbound);
        assert!(registry.contains(&NodeId::from("node-1")));
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let registry = PeerRegistry::new();
        registry.try_add(make_peer("node-1"), 10).unwrap();
        assert_eq!(registry.connected_count(), 1);

        let removed = registry.remove_peer(&NodeId::from("node-1"));
        assert!(removed.is_some());
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_already_connected_rejected() {
        let registry = PeerRegistry::new();
        registry.try_add(make_peer("node-1"), 10).unwrap();
        assert_eq!(
            registry.try_add(make_peer("node-1"), 10),
            Err(DisconnectReason::AlreadyConnected)
        );
        assert_eq!(registry.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let registry = PeerRegistry::new();
        registry.try_add(make_peer("node-1"), 2).unwrap();
        registry.try_add(make_peer("node-2"), 2).unwrap();
        assert_eq!(
            registry.try_add(make_peer("node-3"), 2),
            Err(DisconnectReason::TooManyPeers)
        );

        // A slot frees up once a peer leaves.
        registry.remove_peer(&NodeId::from("node-1"));
        registry.try_add(make_peer("node-3"), 2).unwrap();
    }

    #[tokio::test]
    async fn test_infos_sorted_and_disconnect_all() {
        let registry = PeerRegistry::new();
        registry.try_add(make_peer("node-b"), 10).unwrap();
        registry.try_add(make_peer("node-a"), 10).unwrap();

        let ids: Vec<String> = registry
            .infos()
            .into_iter()
            .map(|info| info.id.to_string())
            .collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);

        registry.disconnect_all(DisconnectReason::Quitting);
        assert!(registry
            .connected_peers()
            .iter()
            .all(|entry| entry.remote.is_closed()));
    }
}
