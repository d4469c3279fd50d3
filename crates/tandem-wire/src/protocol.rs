//! Sub-protocol descriptors.
//!
//! A [`Protocol`] is built once at configuration time and registered with a
//! [`crate::ProtocolRegistry`] before any connection exists. It is read-only
//! from then on.

use crate::dial::DialCandidates;
use crate::error::WireError;
use crate::peer::RemotePeer;
use crate::session::ProtoChannel;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tandem_types::{Capability, NodeId, RecordEntry};

/// Local metadata accessor. Must not block; return a default value rather than fail.
pub type NodeInfoFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Per-peer metadata accessor. `None` means the sub-protocol's own handshake
/// with that peer is still running.
pub type PeerInfoFn = Arc<dyn Fn(&NodeId) -> Option<Value> + Send + Sync>;

/// Runs one negotiated session of a sub-protocol.
///
/// Called on its own task, exactly once per connection that negotiated the
/// protocol. Every inbound message payload must be consumed before the next
/// one can be delivered to any session on the connection. Returning, with or
/// without an error, closes the whole connection.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn run(&self, peer: RemotePeer, rw: ProtoChannel) -> Result<(), WireError>;
}

#[async_trait]
impl<F, Fut> SessionHandler for F
where
    F: Fn(RemotePeer, ProtoChannel) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WireError>> + Send + 'static,
{
    async fn run(&self, peer: RemotePeer, rw: ProtoChannel) -> Result<(), WireError> {
        (self)(peer, rw).await
    }
}

/// A sub-protocol registration record.
#[derive(Clone)]
pub struct Protocol {
    /// Official protocol name, often a three-letter word.
    pub name: String,
    /// Protocol version.
    pub version: u32,
    /// Number of message codes used by the protocol.
    pub length: u64,
    /// Session entry point. Registration fails without one.
    pub handler: Option<Arc<dyn SessionHandler>>,
    /// Optional local metadata for diagnostics.
    pub node_info: Option<NodeInfoFn>,
    /// Optional per-peer metadata for diagnostics.
    pub peer_info: Option<PeerInfoFn>,
    /// Optional nodes this protocol wants dialed.
    pub dial_candidates: Option<DialCandidates>,
    /// Protocol-specific entries for the node record.
    pub attributes: Vec<RecordEntry>,
}

impl Protocol {
    pub fn new(name: impl Into<String>, version: u32, length: u64) -> Self {
        Self {
            name: name.into(),
            version,
            length,
            handler: None,
            node_info: None,
            peer_info: None,
            dial_candidates: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl SessionHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_node_info(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.node_info = Some(Arc::new(f));
        self
    }

    pub fn with_peer_info(
        mut self,
        f: impl Fn(&NodeId) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.peer_info = Some(Arc::new(f));
        self
    }

    pub fn with_dial_candidates(mut self, candidates: DialCandidates) -> Self {
        self.dial_candidates = Some(candidates);
        self
    }

    pub fn with_attribute(mut self, entry: RecordEntry) -> Self {
        self.attributes.push(entry);
        self
    }

    pub fn cap(&self) -> Capability {
        Capability::new(self.name.clone(), self.version)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("length", &self.length)
            .field("handler", &self.handler.is_some())
            .field("node_info", &self.node_info.is_some())
            .field("peer_info", &self.peer_info.is_some())
            .field("dial_candidates", &self.dial_candidates.is_some())
            .field("attributes", &self.attributes)
            .finish()
    }
}
