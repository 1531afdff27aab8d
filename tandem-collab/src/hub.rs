//! The room registry, run as a single actor.
//!
//! Architecture:
//! ```text
//!  sessions ──┐                         ┌─────────────────────────────┐
//!  server  ───┼── HubCommand ──► mailbox│ Hub loop (one task)         │
//!  flushes ───┘    (bounded)            │  rooms: doc → Room          │
//!                                       │  scheduler: dirty entries   │
//!              interval tick ─────────► │  versions: conflict checks  │
//!                                       └──────┬──────────────┬───────┘
//!                                              │              │
//!                          try_send frames ◄───┘              └──► PresenceDirectory
//!                          (per-session queues)                    (read path)
//! ```
//!
//! Every membership change and every broadcast happens on the loop, one
//! command at a time, so members of a room see frames in the order the hub
//! processed them. Nothing on the loop awaits a peer or the store: frames
//! go out with `try_send`, write-through runs on per-document writer tasks,
//! and auto-save flushes run on detached tasks that report back with
//! [`HubCommand::FlushComplete`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::autosave::{self, AutoSaveScheduler, FlushResult};
use crate::broadcast::{
    encode_frame, AtomicBroadcastStats, BroadcastStats, Frame, Member, Room, SlowConsumerPolicy,
};
use crate::fingerprint::Fingerprint;
use crate::presence::PresenceDirectory;
use crate::protocol::{Message, UserInfo};
use crate::version::{DocumentState, VersionStore};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Commands buffered before senders wait
    pub mailbox_capacity: usize,
    /// Time between auto-save ticks
    pub autosave_interval: Duration,
    /// Trailing window of edits a tick flushes
    pub autosave_window: Duration,
    /// Handling of members whose outbound queue is full
    pub slow_consumer: SlowConsumerPolicy,
    /// Registrations beyond this many members are refused
    pub max_peers_per_room: usize,
    /// Append a history snapshot after each successful auto-save
    pub snapshot_on_autosave: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            autosave_interval: Duration::from_secs(60),
            autosave_window: Duration::from_secs(30),
            slow_consumer: SlowConsumerPolicy::Disconnect,
            max_peers_per_room: 100,
            snapshot_on_autosave: false,
        }
    }
}

/// A session asking to join a document's room.
#[derive(Debug)]
pub struct Registration {
    pub conn_id: Uuid,
    pub document_id: String,
    pub user_id: String,
    pub username: String,
    /// Sending half of the session's bounded outbound queue
    pub outbound: mpsc::Sender<Frame>,
}

/// Commands processed by the hub loop.
#[derive(Debug)]
pub enum HubCommand {
    /// Attach a session. `initial` is the state loaded before registering;
    /// the hub prefers its own view if it already has one.
    Register {
        session: Registration,
        initial: DocumentState,
    },
    Unregister {
        conn_id: Uuid,
        document_id: String,
    },
    Route {
        conn_id: Uuid,
        document_id: String,
        message: Message,
    },
    Tick {
        at: Instant,
    },
    FlushComplete(Vec<FlushResult>),
    /// Flush everything, close every queue and stop.
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub is shut down")]
    Closed,
}

/// Cheap, cloneable access to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    directory: PresenceDirectory,
    stats: Arc<AtomicBroadcastStats>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).await.map_err(|_| HubError::Closed)
    }

    pub async fn register(
        &self,
        session: Registration,
        initial: DocumentState,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Register { session, initial }).await
    }

    pub async fn unregister(&self, conn_id: Uuid, document_id: &str) -> Result<(), HubError> {
        self.send(HubCommand::Unregister {
            conn_id,
            document_id: document_id.to_string(),
        })
        .await
    }

    pub async fn route(
        &self,
        conn_id: Uuid,
        document_id: &str,
        message: Message,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Route {
            conn_id,
            document_id: document_id.to_string(),
            message,
        })
        .await
    }

    /// Run an auto-save pass as if the timer fired at `at`.
    pub async fn tick(&self, at: Instant) -> Result<(), HubError> {
        self.send(HubCommand::Tick { at }).await
    }

    /// Stop the hub, waiting until dirty documents are flushed and every
    /// session queue is closed.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (done, rx) = oneshot::channel();
        self.send(HubCommand::Shutdown { done }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // ─── Read path (no mailbox) ───────────────────────────────────────

    pub fn member_count(&self, document_id: &str) -> usize {
        self.directory.member_count(document_id)
    }

    pub fn presence(&self, document_id: &str) -> Vec<UserInfo> {
        self.directory.presence(document_id)
    }

    pub fn room_count(&self) -> usize {
        self.directory.room_count()
    }

    pub fn active_documents(&self) -> Vec<String> {
        self.directory.active_documents()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }
}

/// Actor state. Lives on the task started by [`Hub::spawn`].
pub struct Hub {
    config: HubConfig,
    versions: Arc<VersionStore>,
    rooms: HashMap<String, Room>,
    scheduler: AutoSaveScheduler,
    directory: PresenceDirectory,
    stats: Arc<AtomicBroadcastStats>,
    /// For flush tasks to report back without keeping the loop alive
    mailbox: mpsc::WeakSender<HubCommand>,
}

impl Hub {
    /// Start the hub loop.
    pub fn spawn(config: HubConfig, versions: Arc<VersionStore>) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let directory = PresenceDirectory::new();
        let stats = Arc::new(AtomicBroadcastStats::default());

        let hub = Hub {
            scheduler: AutoSaveScheduler::new(config.autosave_window),
            config,
            versions,
            rooms: HashMap::new(),
            directory: directory.clone(),
            stats: stats.clone(),
            mailbox: tx.downgrade(),
        };
        let task = tokio::spawn(hub.run(rx));

        (
            HubHandle {
                tx,
                directory,
                stats,
            },
            task,
        )
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        let period = self.config.autosave_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Hub started (auto-save every {:?}, window {:?})",
            self.config.autosave_interval,
            self.config.autosave_window
        );

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(HubCommand::Shutdown { done }) => {
                        self.shutdown().await;
                        rx.close();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        // Every handle dropped
                        self.shutdown().await;
                        break;
                    }
                },
                at = ticker.tick() => self.tick(at.into_std()),
            }
        }

        log::info!("Hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { session, initial } => self.register(session, initial),
            HubCommand::Unregister {
                conn_id,
                document_id,
            } => self.unregister(conn_id, &document_id),
            HubCommand::Route {
                conn_id,
                document_id,
                message,
            } => self.route(conn_id, &document_id, message),
            HubCommand::Tick { at } => self.tick(at),
            HubCommand::FlushComplete(results) => {
                for result in &results {
                    self.scheduler.complete(result);
                }
            }
            HubCommand::Shutdown { .. } => {}
        }
    }

    // ─── Membership ───────────────────────────────────────────────────

    fn register(&mut self, session: Registration, initial: DocumentState) {
        let doc_id = session.document_id.clone();

        let occupied = self.rooms.get(&doc_id).map_or(0, Room::len);
        if occupied >= self.config.max_peers_per_room {
            log::warn!(
                "Room {doc_id} is full ({occupied} members); refusing {}",
                session.user_id
            );
            // Dropping the registration closes its queue
            return;
        }

        let state = self.versions.peek(&doc_id).unwrap_or(initial);
        let member = Member::new(
            session.conn_id,
            session.user_id,
            session.username,
            session.outbound,
        );
        let conn_id = member.conn_id;
        let join = Message::join(&member.user_id, &member.username);

        log::info!(
            "{} ({}) joined {doc_id} [{conn_id}]",
            member.username,
            member.user_id
        );

        let stats = self.stats.clone();
        let room = self.rooms.entry(doc_id.clone()).or_insert_with(|| {
            log::info!("Room {doc_id} created");
            Room::new(doc_id.clone(), stats)
        });
        room.add(member);
        self.publish(&doc_id);

        // The join goes out before the initial sync, so a leave for a
        // joiner evicted below always follows its join
        self.broadcast(&doc_id, &join, Some(conn_id));

        let initial_sync = Message::content(&doc_id, state.content, state.version, state.fingerprint);
        self.send_to(&doc_id, conn_id, &initial_sync);
        let users = self
            .rooms
            .get(&doc_id)
            .filter(|room| room.contains(conn_id))
            .map(Room::presence);
        if let Some(users) = users {
            self.send_to(&doc_id, conn_id, &Message::presence(users));
        }
    }

    fn unregister(&mut self, conn_id: Uuid, doc_id: &str) {
        let Some(member) = self.rooms.get_mut(doc_id).and_then(|room| room.remove(conn_id)) else {
            // Already evicted or never admitted
            return;
        };

        log::info!(
            "{} ({}) left {doc_id} [{conn_id}]",
            member.username,
            member.user_id
        );
        let leave = Message::leave(&member.user_id, &member.username);
        self.publish(doc_id);
        drop(member);

        self.broadcast(doc_id, &leave, None);
    }

    // ─── Routing ──────────────────────────────────────────────────────

    fn route(&mut self, conn_id: Uuid, doc_id: &str, message: Message) {
        let Some(member) = self.rooms.get(doc_id).and_then(|room| room.get(conn_id)) else {
            log::debug!(
                "Dropping {} frame from unknown connection {conn_id}",
                message.kind().as_str()
            );
            return;
        };
        let author = Author {
            user_id: member.user_id.clone(),
            username: member.username.clone(),
            known_version: member.known_version,
            known_fingerprint: member.known_fingerprint,
        };

        match message {
            Message::Content {
                content,
                version,
                hash,
                ..
            } => {
                let client_version = version.unwrap_or(author.known_version);
                let client_fingerprint = hash.unwrap_or(author.known_fingerprint);
                self.route_content(
                    conn_id,
                    doc_id,
                    &author,
                    content,
                    client_version,
                    client_fingerprint,
                );
            }
            Message::Cursor {
                position,
                selection_start,
                selection_end,
                ..
            } => {
                if let Some(member) = self.rooms.get_mut(doc_id).and_then(|r| r.get_mut(conn_id)) {
                    member.cursor = Some(position);
                }
                self.publish(doc_id);

                let cursor = Message::Cursor {
                    workspace_id: None,
                    user_id: None,
                    username: None,
                    position,
                    selection_start,
                    selection_end,
                }
                .with_author(&author.user_id, &author.username, doc_id);
                log::trace!("Cursor from {} in {doc_id}: {position}", author.user_id);
                self.broadcast(doc_id, &cursor, Some(conn_id));
            }
            other => {
                log::debug!(
                    "Ignoring {} frame from {} in {doc_id}",
                    other.kind().as_str(),
                    author.user_id
                );
            }
        }
    }

    fn route_content(
        &mut self,
        conn_id: Uuid,
        doc_id: &str,
        author: &Author,
        content: String,
        client_version: u64,
        client_fingerprint: Fingerprint,
    ) {
        let outcome = match self
            .versions
            .update_content(doc_id, content, client_version, client_fingerprint)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Edit from {} dropped: {e}", author.user_id);
                return;
            }
        };

        if outcome.accepted {
            log::debug!(
                "Accepted edit to {doc_id} from {} (v{})",
                author.user_id,
                outcome.version
            );
            let update = Message::content(
                doc_id,
                outcome.content.clone(),
                outcome.version,
                outcome.fingerprint,
            )
            .with_author(&author.user_id, &author.username, doc_id);

            self.scheduler
                .mark_dirty(doc_id, outcome.content, Instant::now());
            self.broadcast(doc_id, &update, None);
        } else {
            log::warn!(
                "Conflict on {doc_id}: {} sent v{client_version}, current v{}",
                author.user_id,
                outcome.version
            );
            let authoritative =
                Message::content(doc_id, outcome.content, outcome.version, outcome.fingerprint)
                    .into_conflict();
            self.send_to(doc_id, conn_id, &authoritative);
        }
    }

    // ─── Delivery ─────────────────────────────────────────────────────

    fn broadcast(&mut self, doc_id: &str, msg: &Message, exclude: Option<Uuid>) {
        let Some(frame) = encode(msg) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(doc_id) else {
            return;
        };
        let evicted = room.broadcast(
            &frame,
            msg.document_state(),
            exclude,
            self.config.slow_consumer,
        );
        self.evict(doc_id, evicted);
    }

    fn send_to(&mut self, doc_id: &str, conn_id: Uuid, msg: &Message) {
        let Some(frame) = encode(msg) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(doc_id) else {
            return;
        };
        let evicted = room.send_to(
            conn_id,
            frame,
            msg.document_state(),
            self.config.slow_consumer,
        );
        self.evict(doc_id, evicted.into_iter().collect());
    }

    /// Tell the room about evicted members, evicting again if that
    /// overflows someone else, until nothing more is evicted.
    fn evict(&mut self, doc_id: &str, mut pending: Vec<Member>) {
        if pending.is_empty() {
            self.cleanup_room(doc_id);
            return;
        }

        self.publish(doc_id);
        while let Some(member) = pending.pop() {
            log::warn!(
                "Evicted slow consumer {} ({}) from {doc_id} [{}]",
                member.username,
                member.user_id,
                member.conn_id
            );
            let leave = Message::leave(&member.user_id, &member.username);
            drop(member);

            let Some(frame) = encode(&leave) else {
                continue;
            };
            let Some(room) = self.rooms.get_mut(doc_id) else {
                break;
            };
            let more = room.broadcast(&frame, None, None, self.config.slow_consumer);
            if !more.is_empty() {
                self.publish(doc_id);
            }
            pending.extend(more);
        }

        self.cleanup_room(doc_id);
    }

    /// Delete the room if it has become empty.
    fn cleanup_room(&mut self, doc_id: &str) {
        if self.rooms.get(doc_id).is_some_and(Room::is_empty) {
            self.rooms.remove(doc_id);
            self.directory.publish(doc_id, Vec::new());
            log::info!("Room {doc_id} deleted (empty)");
        }
    }

    /// Copy the room's membership into the read-path directory.
    fn publish(&self, doc_id: &str) {
        let users = self
            .rooms
            .get(doc_id)
            .map(Room::presence)
            .unwrap_or_default();
        self.directory.publish(doc_id, users);
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn tick(&mut self, at: Instant) {
        let jobs = self.scheduler.due(at);
        if jobs.is_empty() {
            return;
        }
        log::debug!("Auto-save: {} document(s) due", jobs.len());

        let store = self.versions.backend().clone();
        let snapshot = self.config.snapshot_on_autosave;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let results = autosave::flush(store.as_ref(), jobs, snapshot).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(HubCommand::FlushComplete(results)).await;
            }
        });
    }

    async fn shutdown(&mut self) {
        log::info!(
            "Hub shutting down: {} room(s), {} dirty document(s)",
            self.rooms.len(),
            self.scheduler.len()
        );

        // Dropping every member closes every session queue
        self.rooms.clear();
        self.directory.clear();

        self.versions.wait_for_all_writes().await;

        let jobs = self.scheduler.drain_all();
        if !jobs.is_empty() {
            let store = self.versions.backend().clone();
            let results =
                autosave::flush(store.as_ref(), jobs, self.config.snapshot_on_autosave).await;
            let failed = results.iter().filter(|r| !r.ok).count();
            if failed > 0 {
                log::error!("{failed} document(s) could not be saved during shutdown");
            }
        }
    }
}

/// Identity and last-known view of the member a frame came from.
struct Author {
    user_id: String,
    username: String,
    known_version: u64,
    known_fingerprint: Fingerprint,
}

fn encode(msg: &Message) -> Option<Frame> {
    match encode_frame(msg) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Dropping outbound {} frame: {e}", msg.kind().as_str());
            None
        }
    }
}
