//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection setup with identity in the query string
//! - Content edits stamped with the last authoritative version and hash
//! - Cursor updates
//! - A stream of [`SyncEvent`]s for the application
//!
//! The client keeps no document of its own. It remembers the version and
//! fingerprint of the last `content` frame the server sent and bases the
//! next edit on them; a rejected edit comes back as a `content` event with
//! `conflict` set, after which the caller rebases and sends again.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::protocol::{Message, ProtocolError, UserInfo};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Authoritative document text: initial sync, an accepted edit, or the
    /// answer to our rejected edit (`conflict`)
    Content {
        content: String,
        version: Option<u64>,
        hash: Option<Fingerprint>,
        conflict: bool,
        user_id: Option<String>,
    },
    /// A peer joined the document
    Joined { user_id: String, username: String },
    /// A peer left the document
    Left { user_id: String, username: String },
    /// A peer moved its cursor
    Cursor {
        user_id: Option<String>,
        position: i64,
        selection: Option<(i64, i64)>,
    },
    /// Everyone attached to the document
    Users(Vec<UserInfo>),
    /// Connection lost
    Disconnected,
}

impl From<Message> for SyncEvent {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Content {
                content,
                user_id,
                version,
                hash,
                conflict,
                ..
            } => SyncEvent::Content {
                content,
                version,
                hash,
                conflict,
                user_id,
            },
            Message::Join { user_id, username } => SyncEvent::Joined { user_id, username },
            Message::Leave { user_id, username } => SyncEvent::Left { user_id, username },
            Message::Cursor {
                user_id,
                position,
                selection_start,
                selection_end,
                ..
            } => SyncEvent::Cursor {
                user_id,
                position,
                selection: selection_start.zip(selection_end),
            },
            Message::Presence { users } => SyncEvent::Users(users),
        }
    }
}

/// Last authoritative state seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tracked {
    version: u64,
    hash: Fingerprint,
}

impl Default for Tracked {
    fn default() -> Self {
        Self {
            version: 0,
            hash: fingerprint(""),
        }
    }
}

/// Build `{base}/ws/{document_id}?userId=..&username=..`.
pub fn session_url(
    base: &str,
    document_id: &str,
    user_id: &str,
    username: &str,
) -> Result<Url, ProtocolError> {
    let mut url = Url::parse(base).map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ProtocolError::Handshake(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .push("ws")
        .push(document_id);
    url.query_pairs_mut()
        .clear()
        .append_pair("userId", user_id)
        .append_pair("username", username);
    Ok(url)
}

/// The sync client.
///
/// A reader task turns server frames into events; a writer task forwards
/// outgoing frames to the socket.
pub struct SyncClient {
    document_id: String,
    user_id: String,
    username: String,

    /// Connection state
    state: Arc<Mutex<ConnectionState>>,

    /// Version and hash the next edit is based on
    tracked: Arc<Mutex<Tracked>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<WsMessage>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Connect to the server at `base_url` (e.g. `ws://127.0.0.1:8080`).
    pub async fn connect(
        base_url: &str,
        document_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<Self, ProtocolError> {
        let url = session_url(base_url, document_id, user_id, username)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(Mutex::new(ConnectionState::Connected));
        let tracked = Arc::new(Mutex::new(Tracked::default()));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outgoing_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: process incoming WebSocket messages
        let reader_state = state.clone();
        let reader_tracked = tracked.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(WsMessage::Text(text)) => Message::decode(text.as_str()),
                    Ok(WsMessage::Binary(bytes)) => Message::decode_bytes(&bytes),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match decoded {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Ignoring undecodable server frame: {e}");
                        continue;
                    }
                };

                if let Message::Content {
                    version: Some(version),
                    hash: Some(hash),
                    ..
                } = &msg
                {
                    *reader_tracked.lock() = Tracked {
                        version: *version,
                        hash: *hash,
                    };
                }

                if event_tx.send(SyncEvent::from(msg)).await.is_err() {
                    // Nobody is listening; keep tracking versions
                    continue;
                }
            }

            *reader_state.lock() = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        log::debug!("Connected to {url}");
        Ok(Self {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            state,
            tracked,
            outgoing_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(WsMessage::text(encoded))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Submit the full document text, based on the last authoritative state.
    pub async fn send_content(&self, content: impl Into<String>) -> Result<(), ProtocolError> {
        let Tracked { version, hash } = *self.tracked.lock();
        self.send(&Message::edit(content, version, hash)).await
    }

    /// Submit the full document text based on an explicit version and hash.
    pub async fn send_content_at(
        &self,
        content: impl Into<String>,
        version: u64,
        hash: Fingerprint,
    ) -> Result<(), ProtocolError> {
        self.send(&Message::edit(content, version, hash)).await
    }

    /// Send a cursor position with an optional selection.
    pub async fn send_cursor(
        &self,
        position: i64,
        selection: Option<(i64, i64)>,
    ) -> Result<(), ProtocolError> {
        self.send(&Message::cursor(position, selection)).await
    }

    /// Close the connection. The event stream ends with `Disconnected`.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(WsMessage::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Version of the last authoritative `content` frame received.
    pub fn version(&self) -> u64 {
        self.tracked.lock().version
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}
