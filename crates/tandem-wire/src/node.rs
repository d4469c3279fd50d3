//! PeerNode: TCP server and client for multiplexed peer connections.
//!
//! A [`PeerNode`] binds a local TCP listener and accepts incoming connections
//! from other nodes. It also connects outward, either on request or from the
//! dial candidates its protocols supply. Every connection performs the hello
//! exchange, negotiates shared sub-protocols and then runs as a [`Peer`] until
//! it closes, at which point it leaves the [`PeerRegistry`].

use crate::dial::DialCandidates;
use crate::error::{DisconnectReason, WireError};
use crate::handshake::{exchange_hello, local_hello, send_disconnect};
use crate::negotiate::match_protocols;
use crate::peer::{Peer, PeerInfo, PeerTimings, RemotePeer};
use crate::protocols::ProtocolRegistry;
use crate::registry::{Direction, PeerEntry, PeerRegistry};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_types::{NodeAddr, NodeConfig, NodeId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the dialer waits before rechecking a full peer table.
const DIAL_BACKOFF: Duration = Duration::from_millis(500);

/// The local network node: listens for connections and connects to peers.
pub struct PeerNode {
    config: NodeConfig,
    protocols: ProtocolRegistry,
    registry: PeerRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

impl PeerNode {
    /// Create and start listening on the configured address.
    pub async fn start(
        config: NodeConfig,
        protocols: ProtocolRegistry,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        if protocols.is_empty() {
            warn!("Starting node without protocols; every peer will be useless");
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            node_id = %config.node_id,
            protocols = protocols.len(),
            "Listening for peers"
        );

        let (shutdown, _) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            protocols,
            registry: PeerRegistry::new(),
            local_addr,
            shutdown,
            started_at: Utc::now(),
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            node_clone.accept_loop(listener).await;
        });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Get a reference to the peer registry.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Dial a node and bring the connection up.
    ///
    /// When the candidate carries a node ID, a remote answering with another
    /// ID is rejected with [`DisconnectReason::UnexpectedIdentity`].
    pub async fn connect(&self, target: impl Into<NodeAddr>) -> Result<RemotePeer, WireError> {
        let target = target.into();
        if self.is_shutting_down() {
            return Err(WireError::ConnectionClosed);
        }
        debug!(addr = %target, "Dialing peer");
        let stream = tokio::time::timeout(
            self.config.handshake_timeout(),
            TcpStream::connect(target.addr),
        )
        .await
        .map_err(|_| WireError::HandshakeTimeout)??;
        self.setup_conn(stream, target.addr, Direction::Outbound, target.id.as_ref())
            .await
    }

    /// Aggregated local diagnostics: identity, listen address and the node
    /// info of every protocol that provides some.
    pub fn node_info(&self) -> Value {
        let caps: Vec<String> = self
            .protocols
            .caps()
            .iter()
            .map(|c| c.to_string())
            .collect();
        json!({
            "id": self.config.node_id,
            "name": self.config.node_name,
            "listen_addr": self.local_addr.to_string(),
            "started_at": self.started_at,
            "caps": caps,
            "protocols": self.protocols.node_info(),
            "peers": self.registry.connected_count(),
        })
    }

    /// Diagnostics for every connected peer.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.registry.infos()
    }

    /// Dial candidates from every registered protocol plus the configured
    /// bootstrap nodes, until the sources run dry or the node shuts down.
    pub fn start_dialer(self: &Arc<Self>) -> JoinHandle<()> {
        let mut sources: Vec<DialCandidates> = self
            .protocols
            .snapshot()
            .iter()
            .filter_map(|p| p.dial_candidates.clone())
            .collect();
        if !self.config.bootstrap.is_empty() {
            let bootstrap: Vec<NodeAddr> = self
                .config
                .bootstrap
                .iter()
                .copied()
                .map(NodeAddr::from)
                .collect();
            sources.push(DialCandidates::from_addrs(bootstrap));
        }
        let candidates = DialCandidates::mix(sources);

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.dial_loop(candidates).await;
        })
    }

    /// Stop accepting and dialing, and close every connection with `Quitting`.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(
            node_id = %self.config.node_id,
            peers = self.registry.connected_count(),
            "Shutting down node"
        );
        self.registry.disconnect_all(DisconnectReason::Quitting);
    }

    /// Internal accept loop, runs in a spawned task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = wait_shutdown(self.shutdown.subscribe()) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = node.setup_conn(stream, addr, Direction::Inbound, None).await
                        {
                            debug!(%addr, error = %e, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(addr = %self.local_addr, "Accept loop stopped");
    }

    async fn dial_loop(self: Arc<Self>, candidates: DialCandidates) {
        loop {
            while self.registry.connected_count() >= self.config.max_peers {
                tokio::select! {
                    _ = wait_shutdown(self.shutdown.subscribe()) => return,
                    _ = tokio::time::sleep(DIAL_BACKOFF) => {}
                }
            }

            let next = tokio::select! {
                _ = wait_shutdown(self.shutdown.subscribe()) => return,
                next = candidates.next() => next,
            };
            let Some(candidate) = next else {
                debug!("Dial candidates exhausted");
                return;
            };

            if candidate.addr == self.local_addr {
                continue;
            }
            if let Some(id) = &candidate.id {
                if *id == self.config.node_id || self.registry.contains(id) {
                    continue;
                }
            }
            if let Err(e) = self.connect(candidate.clone()).await {
                debug!(addr = %candidate, error = %e, "Dial failed");
            }
        }
    }

    /// Handshake, negotiate, admit and start one connection.
    async fn setup_conn(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
        expected: Option<&NodeId>,
    ) -> Result<RemotePeer, WireError> {
        let _ = stream.set_nodelay(true);
        let hello = local_hello(&self.config, &self.protocols, self.local_addr.port());
        let remote = exchange_hello(&mut stream, &hello, self.config.handshake_timeout()).await?;

        if remote.node_id == self.config.node_id {
            return reject(&mut stream, DisconnectReason::SelfConnection).await;
        }
        if let Some(expected) = expected {
            if *expected != remote.node_id {
                warn!(%addr, expected = %expected, got = %remote.node_id, "Unexpected node identity");
                return reject(&mut stream, DisconnectReason::UnexpectedIdentity).await;
            }
        }
        if self.is_shutting_down() {
            return reject(&mut stream, DisconnectReason::Quitting).await;
        }

        let matched = match_protocols(&self.protocols.snapshot(), &remote.caps);
        if matched.is_empty() {
            debug!(%addr, peer = %remote.node_id, "No shared protocols");
            return reject(&mut stream, DisconnectReason::UselessPeer).await;
        }

        let running: Vec<String> = matched.iter().map(|m| m.cap().to_string()).collect();
        let peer = Peer::new(
            stream,
            remote,
            matched,
            Some(addr),
            PeerTimings::from(&self.config),
        );
        let handle = peer.remote().clone();
        let peer_id = handle.id().clone();

        if let Err(reason) = self.admit(&handle, direction) {
            // Closed before it runs: the peer only sends the disconnect.
            handle.disconnect(reason);
            tokio::spawn(peer.run());
            return Err(WireError::Rejected(reason));
        }

        info!(
            peer = %peer_id,
            name = %handle.name(),
            %addr,
            ?direction,
            protocols = ?running,
            "Peer connected"
        );

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let exit = peer.run().await;
            registry.remove_peer(&peer_id);
            debug!(peer = %peer_id, reason = %exit.reason, "Peer removed");
        });

        Ok(handle)
    }

    /// Enter a negotiated peer into the registry.
    ///
    /// A shutdown that raced past the earlier check has already swept the
    /// registry, so the flag is read again once the peer is in.
    fn admit(&self, handle: &RemotePeer, direction: Direction) -> Result<(), DisconnectReason> {
        self.registry.try_add(
            PeerEntry::new(handle.clone(), direction),
            self.config.max_peers,
        )?;
        if self.is_shutting_down() {
            self.registry.remove_peer(handle.id());
            return Err(DisconnectReason::Quitting);
        }
        Ok(())
    }
}

/// Refuse a peer on a connection that has not started running.
async fn reject(stream: &mut TcpStream, reason: DisconnectReason) -> Result<RemotePeer, WireError> {
    let _ = send_disconnect(stream, reason).await;
    Err(WireError::Rejected(reason))
}

async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
