//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/ws/{doc}?userId=..&username=..
//!             ├── handshake ── VersionStore::load ── Hub::register
//! Client B ──┘                                           │
//!                                                        ├── Room (doc)
//!            inbound_pump ── HubCommand::Route ─────────►│
//!            outbound_pump ◄── bounded queue ◄───────────┘
//!                                                        │
//!                                  DocumentStore (memory | RocksDB)
//! ```
//!
//! Each connection runs two pumps (see [`crate::session`]). The server
//! itself only accepts sockets, resolves the peer's identity from the
//! upgrade request and hands the session to the hub.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::hub::{Hub, HubConfig, HubError, HubHandle, Registration};
use crate::session::{inbound_pump, outbound_pump, SessionIdentity};
use crate::storage::{DocumentStore, StoreError};
use crate::version::VersionStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before the slow-consumer policy applies
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Room registry settings
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            hub: HubConfig::default(),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    malformed_frames: AtomicU64,
}

impl ServerStats {
    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Data frames read from peers, malformed ones included.
    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }
}

/// Keeps `active_connections` honest however a connection ends.
struct ConnectionGuard(Arc<ServerStats>);

impl ConnectionGuard {
    fn new(stats: Arc<ServerStats>) -> Self {
        stats.connection_opened();
        Self(stats)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Document and identity requested by an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub document_id: String,
    pub user_id: String,
    pub username: String,
}

impl ConnectTarget {
    /// Resolve `/ws/{doc}` or `/{doc}` plus the `userId`/`username` query.
    /// The document segment is percent-decoded.
    ///
    /// Returns `None` when the path names no document.
    pub fn from_request(path: &str, query: Option<&str>, peer: IpAddr) -> Option<Self> {
        let rest = path
            .strip_prefix("/ws/")
            .or_else(|| path.strip_prefix('/'))?;
        let segment = rest.trim_end_matches('/');
        if segment.is_empty() || segment == "ws" || segment.contains('/') {
            return None;
        }
        let document_id = percent_decode_str(segment).decode_utf8().ok()?;
        if document_id.is_empty() {
            return None;
        }

        let mut user_id = None;
        let mut username = None;
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "userId" if !value.is_empty() => user_id = Some(value.into_owned()),
                    "username" if !value.is_empty() => username = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        Some(Self {
            document_id: document_id.into_owned(),
            user_id: user_id.unwrap_or_else(|| format!("user_{peer}")),
            username: username.unwrap_or_else(|| "Anonymous".to_string()),
        })
    }
}

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
struct ConnectionContext {
    hub: HubHandle,
    versions: Arc<VersionStore>,
    stats: Arc<ServerStats>,
    outbound_capacity: usize,
    heartbeat: Duration,
}

/// The sync server.
///
/// Owns the hub and the version store. Must be created inside a tokio
/// runtime since the hub loop starts immediately.
pub struct SyncServer {
    config: ServerConfig,
    hub: HubHandle,
    versions: Arc<VersionStore>,
    stats: Arc<ServerStats>,
    stop: watch::Sender<bool>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let versions = Arc::new(VersionStore::new(store));
        let (hub, _task) = Hub::spawn(config.hub.clone(), versions.clone());
        let (stop, _) = watch::channel(false);

        Self {
            config,
            hub,
            versions,
            stats: Arc::new(ServerStats::default()),
            stop,
        }
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        log::info!("Sync server listening on {local}");

        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let ctx = self.context();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                                log::warn!("Connection from {addr} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        // Usually fd exhaustion; the listener itself is fine
                        log::error!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = stop.changed() => break,
            }
        }

        log::info!("Sync server on {local} stopped accepting");
        Ok(())
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            hub: self.hub.clone(),
            versions: self.versions.clone(),
            stats: self.stats.clone(),
            outbound_capacity: self.config.outbound_capacity.max(1),
            heartbeat: Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
        }
    }

    /// Handle a single WebSocket connection from upgrade to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), ServerError> {
        let _guard = ConnectionGuard::new(ctx.stats.clone());

        let mut target = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match ConnectTarget::from_request(req.uri().path(), req.uri().query(), addr.ip()) {
                Some(t) => {
                    target = Some(t);
                    Ok(resp)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some("missing document id".to_string()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(ConnectTarget {
            document_id,
            user_id,
            username,
        }) = target
        else {
            return Ok(());
        };

        log::info!("WebSocket connection from {addr}: {username} ({user_id}) on {document_id}");

        // Load outside the hub loop so registration never waits on storage
        let initial = ctx.versions.load(&document_id).await?;

        let identity = SessionIdentity::new(document_id, user_id, username);
        let (outbound, rx) = mpsc::channel(ctx.outbound_capacity);
        ctx.hub
            .register(
                Registration {
                    conn_id: identity.conn_id,
                    document_id: identity.document_id.clone(),
                    user_id: identity.user_id.clone(),
                    username: identity.username.clone(),
                    outbound,
                },
                initial,
            )
            .await?;

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(outbound_pump(sink, rx, ctx.heartbeat));
        inbound_pump(stream, ctx.hub, identity, ctx.stats.clone()).await;

        // The unregister closes the queue, which ends the writer
        if let Err(e) = writer.await {
            log::warn!("Writer for {addr} panicked: {e}");
        }
        log::info!("Connection closed from {addr}");
        Ok(())
    }

    /// Stop accepting, then flush and close every session.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.stop.send_replace(true);
        self.hub.shutdown().await?;
        Ok(())
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::storage::MemoryStore;
    use futures_util::SinkExt;
    use std::net::Ipv4Addr;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.hub.max_peers_per_room, 100);
    }

    #[test]
    fn test_target_from_ws_path() {
        let target =
            ConnectTarget::from_request("/ws/doc1", Some("userId=u1&username=Alice%20B"), LOCAL)
                .unwrap();
        assert_eq!(target.document_id, "doc1");
        assert_eq!(target.user_id, "u1");
        assert_eq!(target.username, "Alice B");
    }

    #[test]
    fn test_target_defaults() {
        let target = ConnectTarget::from_request("/doc1/", None, LOCAL).unwrap();
        assert_eq!(target.document_id, "doc1");
        assert_eq!(target.user_id, "user_127.0.0.1");
        assert_eq!(target.username, "Anonymous");

        let target = ConnectTarget::from_request("/ws/doc1", Some("userId=&x=1"), LOCAL).unwrap();
        assert_eq!(target.user_id, "user_127.0.0.1");
    }

    #[test]
    fn test_target_decodes_document_segment() {
        let url = crate::client::session_url("ws://localhost:8080", "a b/ü", "u", "n").unwrap();
        let target = ConnectTarget::from_request(url.path(), url.query(), LOCAL).unwrap();
        assert_eq!(target.document_id, "a b/ü");

        // Not valid UTF-8 once decoded
        assert!(ConnectTarget::from_request("/ws/%FF", None, LOCAL).is_none());
    }

    #[test]
    fn test_target_requires_document() {
        assert!(ConnectTarget::from_request("/", None, LOCAL).is_none());
        assert!(ConnectTarget::from_request("/ws/", None, LOCAL).is_none());
        assert!(ConnectTarget::from_request("/ws", None, LOCAL).is_none());
        assert!(ConnectTarget::from_request("/a/b", None, LOCAL).is_none());
        assert!(ConnectTarget::from_request("", None, LOCAL).is_none());
    }

    #[test]
    fn test_stats_counters() {
        let stats = Arc::new(ServerStats::default());
        {
            let _guard = ConnectionGuard::new(stats.clone());
            assert_eq!(stats.active_connections(), 1);
            stats.record_frame();
            stats.record_malformed();
        }
        assert_eq!(stats.total_connections(), 1);
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.total_frames(), 1);
        assert_eq!(stats.malformed_frames(), 1);
    }

    async fn start() -> (Arc<SyncServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SyncServer::new(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
        ));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("read error");
            if let WsMessage::Text(text) = frame {
                return Message::decode(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_connect_receives_initial_sync_then_users() {
        let (server, addr) = start().await;
        let url = format!("ws://{addr}/ws/doc1?userId=c&username=Carol");
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        match next_message(&mut ws).await {
            Message::Content {
                content,
                version,
                workspace_id,
                ..
            } => {
                assert_eq!(content, "");
                assert_eq!(version, Some(0));
                assert_eq!(workspace_id.as_deref(), Some("doc1"));
            }
            other => panic!("Expected content, got {other:?}"),
        }
        match next_message(&mut ws).await {
            Message::Presence { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "c");
                assert_eq!(users[0].username, "Carol");
            }
            other => panic!("Expected users, got {other:?}"),
        }

        assert_eq!(server.hub().member_count("doc1"), 1);
        assert_eq!(server.stats().active_connections(), 1);

        ws.close(None).await.unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while server.hub().member_count("doc1") > 0 || server.stats().active_connections() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "connection not torn down");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_without_document_is_rejected() {
        let (server, addr) = start().await;
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await;
        assert!(result.is_err());
        assert_eq!(server.hub().room_count(), 0);
    }
}
