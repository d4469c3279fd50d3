//! Tandem wire runtime: many sub-protocols over one peer connection.
//!
//! Sub-protocols register a [`Protocol`] descriptor with a [`ProtocolRegistry`].
//! When two peers connect they exchange their canonical capability lists in a
//! hello handshake, match them, and give every shared sub-protocol a disjoint
//! range of message codes on the connection. Each match then runs its session
//! handler on its own task while a single dispatcher routes inbound frames.
//!
//! ## Architecture
//!
//! - **ProtocolRegistry**: validated, canonically ordered set of local protocols
//! - **negotiate**: capability matching and message-code offset assignment
//! - **Peer**: one connection with its dispatcher, keepalive and sessions
//! - **ProtoChannel**: a session's view of the connection, scoped to its code range
//! - **PeerNode**: TCP listener/dialer that turns sockets into running peers
//! - **DialCandidates**: lazy, shared streams of addresses to dial

pub mod dial;
pub mod error;
pub mod handshake;
pub mod message;
pub mod negotiate;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod protocols;
pub mod registry;
pub mod session;

pub use dial::DialCandidates;
pub use error::{DisconnectReason, RegistrationError, WireError};
pub use message::{Msg, Payload};
pub use negotiate::{match_protocols, MatchedProtocol, OffsetTable};
pub use node::PeerNode;
pub use peer::{Peer, PeerExit, PeerInfo, PeerTimings, RemotePeer};
pub use protocol::{Protocol, SessionHandler};
pub use protocols::ProtocolRegistry;
pub use registry::{Direction, PeerEntry, PeerRegistry};
pub use session::{ProtoChannel, ProtoWriter};
