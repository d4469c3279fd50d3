//! One live connection running its negotiated sub-protocols.
//!
//! [`Peer::run`] owns the read half of the transport and acts as the
//! connection's only dispatcher: frames are read one at a time, base-protocol
//! frames are handled inline and everything else is routed by code offset to
//! the owning session. The next frame is not read until the previous payload
//! has been consumed. Sessions run on their own tasks and share one writer.
//!
//! The first session to return closes the connection. Sibling sessions see
//! [`WireError::ConnectionClosed`] on their next read or write and get a short
//! grace period to return before their tasks are aborted.

use crate::error::{DisconnectReason, WireError};
use crate::message::{
    encode_frame, encode_json_frame, read_frame, DisconnectMsg, Hello, Msg, Payload,
    DISCONNECT_MSG, HELLO_MSG, PING_MSG, PONG_MSG,
};
use crate::negotiate::{MatchedProtocol, OffsetTable};
use crate::session::{ConnShared, ProtoChannel, ProtoWriter};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tandem_types::{Capability, NodeConfig, NodeId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Timing knobs for a running connection.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimings {
    pub ping_interval: Duration,
    pub frame_read_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&NodeConfig> for PeerTimings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            frame_read_timeout: config.frame_read_timeout(),
            shutdown_grace: config.session_shutdown_grace(),
        }
    }
}

struct RemoteInner {
    id: NodeId,
    name: String,
    remote_addr: Option<SocketAddr>,
    caps: Vec<Capability>,
    running: Vec<MatchedProtocol>,
    connected_at: DateTime<Utc>,
    conn: Arc<ConnShared>,
}

/// Handle to a connected remote peer, given to every session handler.
#[derive(Clone)]
pub struct RemotePeer {
    inner: Arc<RemoteInner>,
}

impl RemotePeer {
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Everything the remote advertised, shared or not.
    pub fn caps(&self) -> &[Capability] {
        &self.inner.caps
    }

    /// Capabilities running on this connection, in offset order.
    pub fn running_caps(&self) -> Vec<Capability> {
        self.inner.running.iter().map(|m| m.cap()).collect()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Close the connection. Every session unblocks with `ConnectionClosed`.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.inner.conn.close(reason) {
            debug!(peer = %self.inner.id, %reason, "Disconnect requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Diagnostic summary, including each running protocol's peer metadata.
    pub fn info(&self) -> PeerInfo {
        let mut protocols = BTreeMap::new();
        for matched in &self.inner.running {
            let proto = &matched.protocol;
            let value = match &proto.peer_info {
                Some(query) => {
                    query(&self.inner.id).unwrap_or_else(|| Value::from("handshake"))
                }
                None => Value::from("unknown"),
            };
            protocols.insert(proto.name.clone(), value);
        }
        PeerInfo {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            remote_addr: self.inner.remote_addr,
            caps: self.inner.caps.iter().map(|c| c.to_string()).collect(),
            protocols,
            connected_at: self.inner.connected_at,
        }
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("remote_addr", &self.inner.remote_addr)
            .finish()
    }
}

/// Diagnostic information about a connected peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub name: String,
    pub remote_addr: Option<SocketAddr>,
    pub caps: Vec<String>,
    /// Per running protocol name: its peer metadata, `"handshake"` while the
    /// protocol has none yet, or `"unknown"` without an accessor.
    pub protocols: BTreeMap<String, Value>,
    pub connected_at: DateTime<Utc>,
}

/// How a connection ended.
#[derive(Debug)]
pub struct PeerExit {
    pub reason: DisconnectReason,
    /// The sub-protocol whose session ended the connection, if one did.
    pub origin: Option<Capability>,
    pub error: Option<WireError>,
}

/// A negotiated connection, ready to run.
pub struct Peer {
    remote: RemotePeer,
    reader: BoxReader,
    table: OffsetTable,
    timings: PeerTimings,
}

impl Peer {
    /// Wrap a transport that has completed the hello exchange.
    ///
    /// `matched` must be the non-empty result of
    /// [`crate::negotiate::match_protocols`] for this remote.
    pub fn new<T>(
        io: T,
        remote: Hello,
        matched: Vec<MatchedProtocol>,
        remote_addr: Option<SocketAddr>,
        timings: PeerTimings,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let conn = Arc::new(ConnShared::new(Box::new(writer)));
        let remote = RemotePeer {
            inner: Arc::new(RemoteInner {
                id: remote.node_id,
                name: remote.node_name,
                remote_addr,
                caps: remote.caps,
                running: matched.clone(),
                connected_at: Utc::now(),
                conn,
            }),
        };
        Self {
            remote,
            reader: Box::new(reader),
            table: OffsetTable::new(matched),
            timings,
        }
    }

    pub fn remote(&self) -> &RemotePeer {
        &self.remote
    }

    /// Drive the connection until it closes, then report why.
    pub async fn run(self) -> PeerExit {
        let Peer {
            remote,
            reader,
            table,
            timings,
        } = self;
        let conn = Arc::clone(&remote.inner.conn);
        let peer_id = remote.id().clone();

        let mut sessions = JoinSet::new();
        let mut routes = Vec::with_capacity(table.entries().len());
        // A connection rejected before it started runs no sessions.
        let entries = if conn.is_closed() {
            &[][..]
        } else {
            table.entries()
        };
        for matched in entries {
            let cap = matched.cap();
            // Capacity 1: nothing else is sent before the previous payload drains.
            let (tx, rx) = mpsc::channel(1);
            routes.push(tx);
            let writer = ProtoWriter::new(
                cap.clone(),
                matched.offset,
                matched.protocol.length,
                Arc::clone(&conn),
            );
            let rw = ProtoChannel::new(writer, rx);
            let Some(handler) = matched.protocol.handler.clone() else {
                warn!(peer = %peer_id, cap = %cap, "Matched protocol has no handler");
                continue;
            };
            let session_peer = remote.clone();
            debug!(peer = %peer_id, cap = %cap, offset = matched.offset, "Starting session");
            sessions.spawn(async move {
                let result = AssertUnwindSafe(handler.run(session_peer, rw))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(WireError::Protocol("session panicked".into())));
                (cap, result)
            });
        }

        let mut dispatcher = Box::pin(dispatch(
            reader,
            table.clone(),
            routes,
            Arc::clone(&conn),
            timings.frame_read_timeout,
        ));
        let ping_interval = timings.ping_interval.max(Duration::from_millis(1));
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

        let mut remote_initiated = false;
        let exit = loop {
            tokio::select! {
                biased;
                _ = conn.closed() => {
                    break closed_exit(&conn);
                }
                res = &mut dispatcher => {
                    let error = match res {
                        Ok(()) => WireError::ConnectionClosed,
                        Err(e) => e,
                    };
                    // A session that already finished explains the leftover payload.
                    if matches!(error, WireError::PayloadNotConsumed { .. }) {
                        if let Some(joined) = sessions.try_join_next() {
                            break session_exit(joined);
                        }
                    }
                    remote_initiated = matches!(error, WireError::Disconnected(_));
                    break PeerExit {
                        reason: error.disconnect_reason(),
                        origin: None,
                        error: Some(error),
                    };
                }
                Some(joined) = sessions.join_next() => {
                    // A session unblocked by a local close is not the cause.
                    if conn.is_closed() {
                        break closed_exit(&conn);
                    }
                    break session_exit(joined);
                }
                _ = ping.tick() => {
                    let frame = match encode_frame(PING_MSG, &[]) {
                        Ok(frame) => frame,
                        Err(e) => break exit_with(e),
                    };
                    if let Err(e) = conn.write(&frame).await {
                        if !conn.is_closed() || matches!(e, WireError::Io(_)) {
                            break exit_with(e);
                        }
                    }
                }
            }
        };

        // Stop routing: sessions blocked in read_msg see the channel close too.
        drop(dispatcher);
        conn.close(exit.reason);

        if !remote_initiated && exit.reason != DisconnectReason::NetworkError {
            let msg = DisconnectMsg {
                reason: exit.reason,
            };
            if let Ok(frame) = encode_json_frame(DISCONNECT_MSG, &msg) {
                let _ = tokio::time::timeout(timings.shutdown_grace, conn.write_raw(&frame)).await;
            }
        }
        conn.shutdown_writer().await;

        let drained = tokio::time::timeout(timings.shutdown_grace, async {
            while let Some(joined) = sessions.join_next().await {
                if let Ok((cap, Err(e))) = joined {
                    debug!(peer = %peer_id, cap = %cap, error = %e, "Session ended");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                peer = %peer_id,
                remaining = sessions.len(),
                "Sessions did not return within grace period, aborting"
            );
            sessions.abort_all();
        }

        match (&exit.origin, &exit.error) {
            (Some(cap), Some(error)) => {
                warn!(peer = %peer_id, cap = %cap, reason = %exit.reason, error = %error, "Peer connection ended")
            }
            (_, Some(error)) => {
                info!(peer = %peer_id, reason = %exit.reason, error = %error, "Peer connection ended")
            }
            _ => info!(peer = %peer_id, reason = %exit.reason, "Peer connection ended"),
        }
        exit
    }
}

fn closed_exit(conn: &ConnShared) -> PeerExit {
    PeerExit {
        reason: conn.close_reason().unwrap_or(DisconnectReason::Requested),
        origin: None,
        error: None,
    }
}

fn exit_with(error: WireError) -> PeerExit {
    PeerExit {
        reason: error.disconnect_reason(),
        origin: None,
        error: Some(error),
    }
}

/// Turn a finished session into the connection's exit.
fn session_exit(
    joined: Result<(Capability, Result<(), WireError>), tokio::task::JoinError>,
) -> PeerExit {
    match joined {
        Ok((cap, Ok(()))) => PeerExit {
            reason: DisconnectReason::Quitting,
            origin: Some(cap),
            error: None,
        },
        Ok((cap, Err(WireError::Disconnected(reason)))) => PeerExit {
            reason,
            origin: Some(cap),
            error: None,
        },
        Ok((cap, Err(e))) => PeerExit {
            reason: DisconnectReason::SubprotocolError,
            origin: Some(cap.clone()),
            error: Some(WireError::Session {
                cap,
                source: Box::new(e),
            }),
        },
        Err(e) => PeerExit {
            reason: DisconnectReason::SubprotocolError,
            origin: None,
            error: Some(WireError::Protocol(format!("session task failed: {e}"))),
        },
    }
}

/// The connection's read loop. Returns `Err` on anything that ends the connection.
async fn dispatch(
    mut reader: BoxReader,
    table: OffsetTable,
    routes: Vec<mpsc::Sender<Msg>>,
    conn: Arc<ConnShared>,
    read_timeout: Duration,
) -> Result<(), WireError> {
    loop {
        let (code, body) = match tokio::time::timeout(read_timeout, read_frame(&mut reader)).await
        {
            Ok(frame) => frame?,
            Err(_) => return Err(WireError::ReadTimeout),
        };

        match code {
            PING_MSG => {
                let pong = encode_frame(PONG_MSG, &[])?;
                conn.write(&pong).await?;
            }
            PONG_MSG => {}
            DISCONNECT_MSG => {
                let msg: DisconnectMsg = serde_json::from_slice(&body)?;
                return Err(WireError::Disconnected(msg.reason));
            }
            HELLO_MSG => {
                return Err(WireError::Protocol("unexpected hello after handshake".into()));
            }
            code => {
                let (idx, relative) = table.route(code).ok_or(WireError::UnknownCode(code))?;
                let size = body.len() as u32;
                let (payload, drained) = Payload::tracked(body);
                let msg = Msg {
                    code: relative,
                    size,
                    payload,
                    received_at: Utc::now(),
                };
                if routes[idx].send(msg).await.is_err() {
                    // The session already returned; the connection is about to close.
                    continue;
                }
                match drained.await {
                    Ok(0) | Err(_) => {}
                    // Dropped with the queue of a session that already returned.
                    Ok(_) if routes[idx].is_closed() => continue,
                    Ok(remaining) => {
                        return Err(WireError::PayloadNotConsumed {
                            cap: table.entries()[idx].cap(),
                            code: relative,
                            remaining,
                        });
                    }
                }
            }
        }
    }
}
