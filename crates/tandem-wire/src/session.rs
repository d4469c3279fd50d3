//! A session's view of the shared connection.
//!
//! Each negotiated sub-protocol gets a [`ProtoChannel`]: inbound messages
//! routed to it by the dispatcher, and a [`ProtoWriter`] that shifts its codes
//! by the assigned offset. Closing the connection unblocks every pending read
//! and write with [`WireError::ConnectionClosed`].

use crate::error::{DisconnectReason, WireError};
use crate::message::{encode_frame, write_frame, Msg};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tandem_types::Capability;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection state shared by the dispatcher, the sessions and the peer handle.
pub(crate) struct ConnShared {
    writer: Mutex<BoxWriter>,
    closed: watch::Sender<Option<DisconnectReason>>,
}

impl ConnShared {
    pub(crate) fn new(writer: BoxWriter) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Mark the connection closed. The first reason wins.
    pub(crate) fn close(&self, reason: DisconnectReason) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn close_reason(&self) -> Option<DisconnectReason> {
        *self.closed.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Resolves once the connection is closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// Write a frame without looking at the closed flag.
    pub(crate) async fn write_raw(&self, frame: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    /// Write a frame, giving up as soon as the connection closes.
    pub(crate) async fn write(&self, frame: &[u8]) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        tokio::select! {
            _ = self.closed() => Err(WireError::ConnectionClosed),
            res = self.write_raw(frame) => {
                if res.is_err() {
                    self.close(DisconnectReason::NetworkError);
                }
                res
            }
        }
    }

    pub(crate) async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Write side of a session. Cheap to clone; codes are relative to the protocol.
#[derive(Clone)]
pub struct ProtoWriter {
    cap: Capability,
    offset: u64,
    length: u64,
    conn: Arc<ConnShared>,
}

impl ProtoWriter {
    pub(crate) fn new(cap: Capability, offset: u64, length: u64, conn: Arc<ConnShared>) -> Self {
        Self {
            cap,
            offset,
            length,
            conn,
        }
    }

    /// Send a raw payload under a protocol-relative code.
    pub async fn write_msg(&self, code: u64, payload: impl Into<Bytes>) -> Result<(), WireError> {
        if code >= self.length {
            return Err(WireError::InvalidCode {
                cap: self.cap.clone(),
                code,
                length: self.length,
            });
        }
        let payload = payload.into();
        let frame = encode_frame(self.offset + code, &payload)?;
        self.conn.write(&frame).await
    }

    /// Send `value` as a JSON payload.
    pub async fn send<T: Serialize>(&self, code: u64, value: &T) -> Result<(), WireError> {
        let json = serde_json::to_vec(value)?;
        self.write_msg(code, json).await
    }

    pub fn cap(&self) -> &Capability {
        &self.cap
    }
}

/// A session's bidirectional channel, scoped to its code range.
pub struct ProtoChannel {
    writer: ProtoWriter,
    inbound: mpsc::Receiver<Msg>,
}

impl ProtoChannel {
    pub(crate) fn new(writer: ProtoWriter, inbound: mpsc::Receiver<Msg>) -> Self {
        Self { writer, inbound }
    }

    /// Wait for the next message for this protocol.
    ///
    /// The returned payload must be consumed before the connection delivers
    /// anything else, to this session or any other.
    pub async fn read_msg(&mut self) -> Result<Msg, WireError> {
        let conn = Arc::clone(&self.writer.conn);
        tokio::select! {
            biased;
            _ = conn.closed() => Err(WireError::ConnectionClosed),
            msg = self.inbound.recv() => msg.ok_or(WireError::ConnectionClosed),
        }
    }

    pub async fn write_msg(&self, code: u64, payload: impl Into<Bytes>) -> Result<(), WireError> {
        self.writer.write_msg(code, payload).await
    }

    pub async fn send<T: Serialize>(&self, code: u64, value: &T) -> Result<(), WireError> {
        self.writer.send(code, value).await
    }

    /// A cloneable writer for use from other tasks.
    pub fn writer(&self) -> ProtoWriter {
        self.writer.clone()
    }

    pub fn cap(&self) -> &Capability {
        &self.writer.cap
    }
}
