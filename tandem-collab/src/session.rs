//! Per-connection pumps.
//!
//! ```text
//!             ┌──────────── inbound_pump ────────────┐
//!  websocket ─┤ decode → stamp identity → hub.route  ├─► hub mailbox
//!   (read)    └──── exit: exactly one Unregister ────┘
//!
//!             ┌──────────── outbound_pump ───────────┐
//!  websocket ◄┤ queue.recv → send text | ping ticker │◄── bounded queue
//!   (write)   └──── exit: queue closed → Close ──────┘     (hub try_send)
//! ```
//!
//! The two pumps run independently. The outbound pump stops only when its
//! queue is closed (the hub dropped the member) or the transport fails;
//! frames are written in the order the hub queued them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::hub::HubHandle;
use crate::protocol::Message;
use crate::server::ServerStats;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub conn_id: Uuid,
    pub document_id: String,
    pub user_id: String,
    pub username: String,
}

impl SessionIdentity {
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            document_id: document_id.into(),
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Read frames until the peer goes away, routing each decoded message to
/// the hub.
///
/// Malformed frames are logged and skipped. However the loop ends, one
/// `Unregister` is sent for this connection.
pub async fn inbound_pump<S>(
    mut stream: S,
    hub: HubHandle,
    identity: SessionIdentity,
    stats: Arc<ServerStats>,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let SessionIdentity {
        conn_id,
        document_id,
        user_id,
        username,
    } = identity;

    while let Some(item) = stream.next().await {
        let decoded = match item {
            Ok(WsMessage::Text(text)) => Message::decode(text.as_str()),
            Ok(WsMessage::Binary(bytes)) => Message::decode_bytes(&bytes),
            Ok(WsMessage::Close(_)) => {
                log::debug!("{user_id} closed connection {conn_id}");
                break;
            }
            // Pings are answered by the transport
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Read error on connection {conn_id}: {e}");
                break;
            }
        };
        stats.record_frame();

        match decoded {
            Ok(message) => {
                log::trace!("{} frame from {user_id} on {document_id}", message.kind().as_str());
                let message = message.with_author(&user_id, &username, &document_id);
                if hub.route(conn_id, &document_id, message).await.is_err() {
                    log::debug!("Hub closed; ending connection {conn_id}");
                    break;
                }
            }
            Err(e) => {
                stats.record_malformed();
                log::warn!("Dropping malformed frame from {user_id} on {document_id}: {e}");
            }
        }
    }

    if let Err(e) = hub.unregister(conn_id, &document_id).await {
        log::debug!("Unregister of {conn_id} skipped: {e}");
    }
}

/// Drain the outbound queue onto the transport, pinging every `heartbeat`.
///
/// Returns once the queue is closed (after sending a Close frame) or a
/// write fails.
pub async fn outbound_pump<K>(mut sink: K, mut rx: mpsc::Receiver<Frame>, heartbeat: Duration)
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    let heartbeat = heartbeat.max(Duration::from_millis(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(WsMessage::text(frame.to_string())).await {
                        log::warn!("Write failed: {e}");
                        return;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    log::debug!("Heartbeat failed: {e}");
                    return;
                }
            }
        }
    }

    // Queue closed: the hub is done with this session
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}
