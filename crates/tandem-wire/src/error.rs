//! Error types for registration and for running connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_types::Capability;
use thiserror::Error;

/// Configuration errors reported by [`crate::ProtocolRegistry::register`].
///
/// These never affect connections that are already running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("protocol {0} declares an empty message code space")]
    ZeroLength(Capability),
    #[error("protocol {0} is already registered")]
    Duplicate(Capability),
    #[error("protocol {0} has no session handler")]
    MissingHandler(Capability),
    #[error("protocol {0} declares a message code space past the end of the code range")]
    CodeSpaceTooLarge(Capability),
}

/// Why a peer connection was (or is being) torn down.
///
/// Sent to the remote side in a disconnect message when possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Disconnect requested locally or by the remote.
    Requested,
    /// The transport failed or closed underneath the connection.
    NetworkError,
    /// A frame or message violated the multiplexing protocol.
    ProtocolError,
    /// The peers share no sub-protocol.
    UselessPeer,
    /// The node is at its peer limit.
    TooManyPeers,
    /// A connection with this node already exists.
    AlreadyConnected,
    /// Base protocol versions differ.
    IncompatibleVersion,
    /// The remote turned out to be ourselves.
    SelfConnection,
    /// A dialed node answered with a different ID than expected.
    UnexpectedIdentity,
    /// Nothing was received within the frame read timeout.
    ReadTimeout,
    /// A session finished, or the node is shutting down.
    Quitting,
    /// A session handler failed.
    SubprotocolError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolError => "breach of protocol",
            DisconnectReason::UselessPeer => "no shared sub-protocols",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleVersion => "incompatible base protocol version",
            DisconnectReason::SelfConnection => "connected to self",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::ReadTimeout => "read timeout",
            DisconnectReason::Quitting => "client quitting",
            DisconnectReason::SubprotocolError => "sub-protocol error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the wire layer: transport, framing, negotiation and sessions.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Base protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Message code {code} out of range for {cap} (length {length})")]
    InvalidCode {
        cap: Capability,
        code: u64,
        length: u64,
    },
    #[error("Unknown message code {0}")]
    UnknownCode(u64),
    #[error("{cap} left {remaining} unread payload bytes in message {code}")]
    PayloadNotConsumed {
        cap: Capability,
        code: u64,
        remaining: usize,
    },
    #[error("No frame received within the read timeout")]
    ReadTimeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),
    #[error("Rejected peer: {0}")]
    Rejected(DisconnectReason),
    #[error("{cap} session failed: {source}")]
    Session {
        cap: Capability,
        #[source]
        source: Box<WireError>,
    },
}

impl WireError {
    /// The disconnect reason a connection reports when it ends with this error.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            WireError::Disconnected(reason) | WireError::Rejected(reason) => *reason,
            WireError::Io(_) | WireError::ConnectionClosed => DisconnectReason::NetworkError,
            WireError::ReadTimeout => DisconnectReason::ReadTimeout,
            WireError::VersionMismatch { .. } => DisconnectReason::IncompatibleVersion,
            WireError::Session { .. } => DisconnectReason::SubprotocolError,
            WireError::Json(_)
            | WireError::HandshakeFailed(_)
            | WireError::HandshakeTimeout
            | WireError::MessageTooLarge { .. }
            | WireError::InvalidCode { .. }
            | WireError::UnknownCode(_)
            | WireError::PayloadNotConsumed { .. }
            | WireError::Protocol(_) => DisconnectReason::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DisconnectReason::UselessPeer).unwrap();
        assert_eq!(json, "\"useless_peer\"");
        let back: DisconnectReason = serde_json::from_str("\"too_many_peers\"").unwrap();
        assert_eq!(back, DisconnectReason::TooManyPeers);
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            WireError::ConnectionClosed.disconnect_reason(),
            DisconnectReason::NetworkError
        );
        assert_eq!(
            WireError::UnknownCode(99).disconnect_reason(),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            WireError::Disconnected(DisconnectReason::TooManyPeers).disconnect_reason(),
            DisconnectReason::TooManyPeers
        );
        assert_eq!(
            WireError::Rejected(DisconnectReason::UselessPeer).disconnect_reason(),
            DisconnectReason::UselessPeer
        );
        let session = WireError::Session {
            cap: Capability::new("abc", 1),
            source: Box::new(WireError::Protocol("bad state".into())),
        };
        assert_eq!(session.disconnect_reason(), DisconnectReason::SubprotocolError);
    }

    #[test]
    fn test_session_error_names_capability() {
        let err = WireError::Session {
            cap: Capability::new("abc", 1),
            source: Box::new(WireError::Protocol("bad state".into())),
        };
        let text = err.to_string();
        assert!(text.contains("abc/1"), "{text}");
        assert!(text.contains("bad state"), "{text}");
    }

    #[test]
    fn test_useless_peer_distinct_from_subprotocol_error() {
        assert_ne!(
            DisconnectReason::UselessPeer.to_string(),
            DisconnectReason::SubprotocolError.to_string()
        );
    }
}
