//! Frames, messages and base-protocol message types.
//!
//! Every frame on a connection is a 4-byte big-endian length header followed
//! by an 8-byte big-endian message code and the payload. The length covers
//! the code and the payload. Codes below [`crate::negotiate::BASE_PROTOCOL_LENGTH`]
//! belong to the base protocol; the rest are routed to sub-protocol sessions.

use crate::error::{DisconnectReason, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_types::{Capability, NodeId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the message code that follows the length header.
const CODE_LEN: usize = 8;

/// Current base protocol version, exchanged in the hello.
pub const BASE_PROTOCOL_VERSION: u32 = 5;

// Base protocol message codes.
pub const HELLO_MSG: u64 = 0;
pub const DISCONNECT_MSG: u64 = 1;
pub const PING_MSG: u64 = 2;
pub const PONG_MSG: u64 = 3;

/// First message on every connection, sent by both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Base protocol version.
    pub protocol_version: u32,
    /// The sender's node ID.
    pub node_id: NodeId,
    /// Human-readable node name.
    pub node_name: String,
    /// Canonically sorted capabilities of the sender.
    pub caps: Vec<Capability>,
    /// Port the sender accepts connections on (0 if none).
    #[serde(default)]
    pub listen_port: u16,
}

/// Body of a disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMsg {
    pub reason: DisconnectReason,
}

/// Encode a frame (4-byte length + 8-byte code + payload).
pub fn encode_frame(code: u64, payload: &[u8]) -> Result<Bytes, WireError> {
    let len = CODE_LEN + payload.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    buf.put_u64(code);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode a frame whose payload is the JSON form of `value`.
pub fn encode_json_frame<T: Serialize>(code: u64, value: &T) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(value)?;
    encode_frame(code, &json)
}

/// Write one pre-encoded frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, returning its code and payload.
///
/// A clean EOF before the header is reported as [`WireError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<(u64, Bytes), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if (len as usize) < CODE_LEN {
        return Err(WireError::Protocol(format!(
            "frame of {len} bytes is shorter than its message code"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let mut body = Bytes::from(body);
    let code_bytes = body.split_to(CODE_LEN);
    let mut code = [0u8; CODE_LEN];
    code.copy_from_slice(&code_bytes);
    Ok((u64::from_be_bytes(code), body))
}

/// A message delivered to a session.
///
/// `code` is relative to the session's offset. The payload must be fully
/// consumed (or explicitly discarded) before the connection can deliver the
/// next message to any session.
#[derive(Debug)]
pub struct Msg {
    /// Message code, relative to the sub-protocol.
    pub code: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Message body.
    pub payload: Payload,
    /// When the frame was read off the connection.
    pub received_at: DateTime<Utc>,
}

impl Msg {
    /// Decode the JSON payload, consuming it.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, WireError> {
        self.payload.decode()
    }

    /// Skip the payload.
    pub fn discard(self) {
        self.payload.discard();
    }
}

/// The body of a [`Msg`].
///
/// When a payload is dropped it reports how many bytes were left unread to the
/// connection's dispatcher, which treats anything but zero as a protocol
/// violation.
#[derive(Debug, Default)]
pub struct Payload {
    data: Bytes,
    pos: usize,
    drained: Option<oneshot::Sender<usize>>,
}

impl Payload {
    /// A payload nobody waits on.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            drained: None,
        }
    }

    /// A payload whose consumption is reported on the returned receiver.
    pub(crate) fn tracked(data: Bytes) -> (Self, oneshot::Receiver<usize>) {
        let (tx, rx) = oneshot::channel();
        let payload = Self {
            data,
            pos: 0,
            drained: Some(tx),
        };
        (payload, rx)
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Copy up to `buf.len()` unread bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Take everything that has not been read yet.
    pub fn read_to_end(mut self) -> Bytes {
        let rest = std::mem::take(&mut self.data).slice(self.pos..);
        self.pos = 0;
        rest
    }

    /// Read the rest of the payload as JSON.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, WireError> {
        let bytes = self.read_to_end();
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Mark the payload as consumed without looking at it.
    pub fn discard(mut self) {
        self.pos = self.data.len();
    }
}

impl std::io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(Payload::read(self, buf))
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(tx) = self.drained.take() {
            let _ = tx.send(self.remaining());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_frame_layout() {
        let frame = encode_frame(17, b"hi").unwrap();
        assert_eq!(&frame[..4], &10u32.to_be_bytes());
        assert_eq!(&frame[4..12], &17u64.to_be_bytes());
        assert_eq!(&frame[12..], b"hi");

        let mut reader: &[u8] = &frame;
        let (code, body) = read_frame(&mut reader).await.unwrap();
        assert_eq!(code, 17);
        assert_eq!(&body[..], b"hi");
    }

    #[tokio::test]
    async fn test_read_frame_split_across_reads() {
        let frame = encode_frame(PING_MSG, b"").unwrap();
        let mut mock = Builder::new().read(&frame[..3]).read(&frame[3..]).build();
        let (code, body) = read_frame(&mut mock).await.unwrap();
        assert_eq!(code, PING_MSG);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut reader: &[u8] = &header;
        match read_frame(&mut reader).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, MAX_MESSAGE_SIZE + 1);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_frame_rejected() {
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 1]);
        let mut reader: &[u8] = &bytes;
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_write_frame_flushes_whole_frame() {
        let frame = encode_frame(PONG_MSG, b"").unwrap();
        let mut mock = Builder::new().write(&frame).build();
        write_frame(&mut mock, &frame).await.unwrap();
    }

    #[test]
    fn test_hello_json() {
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            node_id: NodeId::from("node-a"),
            node_name: "alpha".to_string(),
            caps: vec![Capability::new("abc", 1)],
            listen_port: 30303,
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"node_id\":\"node-a\""));
        let decoded: Hello = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, hello);

        // listen_port is optional on the wire
        let minimal: Hello = serde_json::from_str(
            r#"{"protocol_version":5,"node_id":"x","node_name":"y","caps":[]}"#,
        )
        .unwrap();
        assert_eq!(minimal.listen_port, 0);
    }

    #[test]
    fn test_payload_reports_consumption() {
        let (payload, mut rx) = Payload::tracked(Bytes::from_static(b"abcdef"));
        let body = payload.read_to_end();
        assert_eq!(&body[..], b"abcdef");
        assert_eq!(rx.try_recv().unwrap(), 0);
    }

    #[test]
    fn test_payload_partial_read_reports_remaining() {
        let (mut payload, mut rx) = Payload::tracked(Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        assert_eq!(payload.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(payload.remaining(), 2);
        drop(payload);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_payload_discard() {
        let (payload, mut rx) = Payload::tracked(Bytes::from_static(b"xyz"));
        payload.discard();
        assert_eq!(rx.try_recv().unwrap(), 0);
    }

    #[test]
    fn test_payload_decode_json() {
        let msg = Msg {
            code: 1,
            size: 13,
            payload: Payload::new(&b"{\"count\":42}"[..]),
            received_at: Utc::now(),
        };
        let value: serde_json::Value = msg.decode().unwrap();
        assert_eq!(value["count"], 42);
    }

    #[test]
    fn test_payload_io_read() {
        use std::io::Read;
        let mut payload = Payload::new(&b"stream"[..]);
        let mut out = String::new();
        payload.read_to_string(&mut out).unwrap();
        assert_eq!(out, "stream");
        assert_eq!(payload.remaining(), 0);
    }
}
