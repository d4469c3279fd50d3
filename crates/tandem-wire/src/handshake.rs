//! Hello exchange performed on every fresh connection.
//!
//! Both sides send a [`Hello`] carrying their canonical capability list and
//! read the other's. Nothing else may be sent before the exchange completes.

use crate::error::{DisconnectReason, WireError};
use crate::message::{
    encode_json_frame, read_frame, write_frame, DisconnectMsg, Hello, BASE_PROTOCOL_VERSION,
    DISCONNECT_MSG, HELLO_MSG,
};
use crate::protocols::ProtocolRegistry;
use std::time::Duration;
use tandem_types::NodeConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Build this node's hello from its config and registered protocols.
pub fn local_hello(config: &NodeConfig, protocols: &ProtocolRegistry, listen_port: u16) -> Hello {
    Hello {
        protocol_version: BASE_PROTOCOL_VERSION,
        node_id: config.node_id.clone(),
        node_name: config.node_name.clone(),
        caps: protocols.caps(),
        listen_port,
    }
}

/// Send our hello and read the remote's, within `timeout`.
pub async fn exchange_hello<T>(
    io: &mut T,
    local: &Hello,
    timeout: Duration,
) -> Result<Hello, WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let frame = encode_json_frame(HELLO_MSG, local)?;
        write_frame(io, &frame).await?;

        let (code, body) = read_frame(io).await?;
        match code {
            HELLO_MSG => Ok(serde_json::from_slice::<Hello>(&body)?),
            DISCONNECT_MSG => {
                let msg: DisconnectMsg = serde_json::from_slice(&body)?;
                Err(WireError::Disconnected(msg.reason))
            }
            other => Err(WireError::HandshakeFailed(format!(
                "expected hello, got message code {other}"
            ))),
        }
    };

    let remote = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WireError::HandshakeTimeout)??;

    if remote.protocol_version != local.protocol_version {
        let _ = send_disconnect(io, DisconnectReason::IncompatibleVersion).await;
        return Err(WireError::VersionMismatch {
            local: local.protocol_version,
            remote: remote.protocol_version,
        });
    }
    debug!(
        peer = %remote.node_id,
        name = %remote.node_name,
        caps = remote.caps.len(),
        "Received hello"
    );
    Ok(remote)
}

/// Tell the remote why we are dropping the connection. Best effort.
pub async fn send_disconnect<T>(io: &mut T, reason: DisconnectReason) -> Result<(), WireError>
where
    T: AsyncWrite + Unpin,
{
    let frame = encode_json_frame(DISCONNECT_MSG, &DisconnectMsg { reason })?;
    write_frame(io, &frame).await
}
