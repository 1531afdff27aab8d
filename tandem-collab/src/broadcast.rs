//! Room membership and non-blocking fan-out.
//!
//! Each member owns the sending half of its session's bounded outbound
//! queue. Fan-out uses `try_send`, so the hub never waits on a slow peer:
//! a full queue is handled by the [`SlowConsumerPolicy`], a closed one
//! always evicts. Evicted members are handed back to the caller, and
//! dropping a [`Member`] drops its sender, which closes the queue exactly
//! once.
//!
//! Frames are encoded once per broadcast and shared as `Arc<str>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::protocol::{Message, ProtocolError, UserInfo};

/// A pre-encoded JSON text frame.
pub type Frame = Arc<str>;

/// Encode a message into a shareable frame.
pub fn encode_frame(msg: &Message) -> Result<Frame, ProtocolError> {
    msg.encode().map(Frame::from)
}

/// What to do when a member's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlowConsumerPolicy {
    /// Evict on the first full-queue send.
    #[default]
    Disconnect,
    /// Drop frames for the member and evict once `max_consecutive_drops`
    /// sends in a row found the queue full. A successful send resets the
    /// count.
    Tolerate { max_consecutive_drops: u32 },
}

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub evictions: u64,
}

/// Broadcast counters shared by every room.
///
/// Updated with relaxed atomics on the hot path, read via `snapshot()`.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    evictions: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    Dropped,
    Evict,
}

/// A session attached to a room.
#[derive(Debug)]
pub struct Member {
    pub conn_id: Uuid,
    pub user_id: String,
    pub username: String,
    pub cursor: Option<i64>,
    /// Version last delivered to this session
    pub known_version: u64,
    /// Fingerprint last delivered to this session
    pub known_fingerprint: Fingerprint,
    tx: mpsc::Sender<Frame>,
    consecutive_drops: u32,
}

impl Member {
    pub fn new(
        conn_id: Uuid,
        user_id: impl Into<String>,
        username: impl Into<String>,
        tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            username: username.into(),
            cursor: None,
            known_version: 0,
            known_fingerprint: Fingerprint::of(""),
            tx,
            consecutive_drops: 0,
        }
    }

    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            cursor_position: self.cursor,
        }
    }

    /// Record the authoritative state this session has been sent.
    fn observe(&mut self, version: u64, fingerprint: Fingerprint) {
        self.known_version = version;
        self.known_fingerprint = fingerprint;
    }

    /// Queue `frame`. `state` is the document view the frame carries; it
    /// becomes the member's known view only if the frame was queued.
    fn deliver(
        &mut self,
        frame: Frame,
        state: Option<(u64, Fingerprint)>,
        policy: SlowConsumerPolicy,
        stats: &AtomicBroadcastStats,
    ) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.consecutive_drops = 0;
                if let Some((version, fingerprint)) = state {
                    self.observe(version, fingerprint);
                }
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Closed(_)) => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Evict
            }
            Err(TrySendError::Full(_)) => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                match policy {
                    SlowConsumerPolicy::Disconnect => Delivery::Evict,
                    SlowConsumerPolicy::Tolerate {
                        max_consecutive_drops,
                    } => {
                        self.consecutive_drops += 1;
                        if self.consecutive_drops >= max_consecutive_drops {
                            Delivery::Evict
                        } else {
                            Delivery::Dropped
                        }
                    }
                }
            }
        }
    }
}

/// The sessions attached to one document, in join order.
#[derive(Debug)]
pub struct Room {
    document_id: String,
    members: Vec<Member>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Room {
    pub fn new(document_id: impl Into<String>, stats: Arc<AtomicBroadcastStats>) -> Self {
        Self {
            document_id: document_id.into(),
            members: Vec::new(),
            stats,
        }
    }

    pub fn add(&mut self, member: Member) {
        self.members.push(member);
    }

    /// Detach a member. Dropping the returned value closes its queue.
    pub fn remove(&mut self, conn_id: Uuid) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.conn_id == conn_id)?;
        Some(self.members.remove(idx))
    }

    pub fn get(&self, conn_id: Uuid) -> Option<&Member> {
        self.members.iter().find(|m| m.conn_id == conn_id)
    }

    pub fn get_mut(&mut self, conn_id: Uuid) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.conn_id == conn_id)
    }

    pub fn contains(&self, conn_id: Uuid) -> bool {
        self.get(conn_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Presence snapshot in join order.
    pub fn presence(&self) -> Vec<UserInfo> {
        self.members.iter().map(Member::user_info).collect()
    }

    /// Send to a single member. Returns the member if it had to be evicted.
    ///
    /// `state` is the version and fingerprint a `content` frame carries.
    pub fn send_to(
        &mut self,
        conn_id: Uuid,
        frame: Frame,
        state: Option<(u64, Fingerprint)>,
        policy: SlowConsumerPolicy,
    ) -> Option<Member> {
        let member = self.members.iter_mut().find(|m| m.conn_id == conn_id)?;
        if member.deliver(frame, state, policy, &self.stats) == Delivery::Evict {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("Evicting {conn_id} from {}", self.document_id);
            return self.remove(conn_id);
        }
        None
    }

    /// Send to every member except `exclude`, never blocking.
    ///
    /// Members that must be evicted are removed from the room and returned.
    pub fn broadcast(
        &mut self,
        frame: &Frame,
        state: Option<(u64, Fingerprint)>,
        exclude: Option<Uuid>,
        policy: SlowConsumerPolicy,
    ) -> Vec<Member> {
        let stats = &self.stats;
        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(self.members.len());

        for mut member in self.members.drain(..) {
            if Some(member.conn_id) == exclude {
                kept.push(member);
                continue;
            }
            match member.deliver(frame.clone(), state, policy, stats) {
                Delivery::Evict => {
                    stats.evictions.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Evicting {} from {}", member.conn_id, self.document_id);
                    evicted.push(member);
                }
                Delivery::Sent | Delivery::Dropped => kept.push(member),
            }
        }

        self.members = kept;
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, capacity: usize) -> (Member, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Member::new(Uuid::new_v4(), name, name, tx), rx)
    }

    fn room() -> Room {
        Room::new("doc1", Arc::new(AtomicBroadcastStats::default()))
    }

    fn frame(text: &str) -> Frame {
        Frame::from(text)
    }

    #[tokio::test]
    async fn test_room_add_remove() {
        let mut room = room();
        let (alice, _rx) = member("alice", 4);
        let id = alice.conn_id;

        room.add(alice);
        assert_eq!(room.len(), 1);
        assert!(room.contains(id));

        assert!(room.remove(id).is_some());
        assert!(room.is_empty());
        assert!(room.remove(id).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut room = room();
        let (a, mut rx_a) = member("a", 4);
        let (b, mut rx_b) = member("b", 4);
        let (c, mut rx_c) = member("c", 4);
        let sender = a.conn_id;
        room.add(a);
        room.add(b);
        room.add(c);

        let evicted = room.broadcast(&frame("hi"), None, Some(sender), SlowConsumerPolicy::Disconnect);
        assert!(evicted.is_empty());

        assert_eq!(&*rx_b.recv().await.unwrap(), "hi");
        assert_eq!(&*rx_c.recv().await.unwrap(), "hi");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_in_join_order() {
        let mut room = room();
        let (c, _rx_c) = member("carol", 4);
        let (mut d, _rx_d) = member("dan", 4);
        d.cursor = Some(3);
        room.add(c);
        room.add(d);

        let users = room.presence();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "carol");
        assert_eq!(users[1].user_id, "dan");
        assert_eq!(users[1].cursor_position, Some(3));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_without_blocking() {
        let mut room = room();
        let (slow, mut rx_slow) = member("slow", 2);
        let (fast, mut rx_fast) = member("fast", 16);
        let slow_id = slow.conn_id;
        room.add(slow);
        room.add(fast);

        let mut evicted = Vec::new();
        for i in 0..3 {
            evicted.extend(room.broadcast(&frame(&i.to_string()), None, None, SlowConsumerPolicy::Disconnect));
        }

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].conn_id, slow_id);
        assert!(!room.contains(slow_id));
        drop(evicted);

        // The slow queue holds what fit, then reports closed
        assert_eq!(&*rx_slow.recv().await.unwrap(), "0");
        assert_eq!(&*rx_slow.recv().await.unwrap(), "1");
        assert!(rx_slow.recv().await.is_none());

        for i in 0..3 {
            assert_eq!(&*rx_fast.recv().await.unwrap(), i.to_string().as_str());
        }

        let stats = room.stats.snapshot();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_sent, 5);
    }

    #[tokio::test]
    async fn test_tolerate_policy_drops_then_evicts() {
        let mut room = room();
        let (slow, mut rx) = member("slow", 1);
        room.add(slow);
        let policy = SlowConsumerPolicy::Tolerate {
            max_consecutive_drops: 2,
        };

        assert!(room.broadcast(&frame("a"), None, None, policy).is_empty());
        // Full: first drop is tolerated
        assert!(room.broadcast(&frame("b"), None, None, policy).is_empty());

        // A successful send resets the streak
        assert_eq!(&*rx.recv().await.unwrap(), "a");
        assert!(room.broadcast(&frame("c"), None, None, policy).is_empty());
        assert!(room.broadcast(&frame("d"), None, None, policy).is_empty());
        assert_eq!(room.broadcast(&frame("e"), None, None, policy).len(), 1);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_known_view_follows_queued_frames_only() {
        let mut room = room();
        let (full, _rx_full) = member("full", 1);
        let (open, _rx_open) = member("open", 8);
        let (full_id, open_id) = (full.conn_id, open.conn_id);
        room.add(full);
        room.add(open);
        let policy = SlowConsumerPolicy::Tolerate {
            max_consecutive_drops: 10,
        };

        let v1 = Fingerprint::of("one");
        assert!(room.broadcast(&frame("1"), Some((1, v1)), None, policy).is_empty());
        // "full" has no room left for this one
        let v2 = Fingerprint::of("two");
        assert!(room.broadcast(&frame("2"), Some((2, v2)), None, policy).is_empty());

        let full = room.get(full_id).unwrap();
        assert_eq!((full.known_version, full.known_fingerprint), (1, v1));
        let open = room.get(open_id).unwrap();
        assert_eq!((open.known_version, open.known_fingerprint), (2, v2));

        // Frames without a document view leave it alone
        assert!(room.send_to(open_id, frame("cursor"), None, policy).is_none());
        assert_eq!(room.get(open_id).unwrap().known_version, 2);
    }

    #[tokio::test]
    async fn test_closed_queue_evicts() {
        let mut room = room();
        let (gone, rx) = member("gone", 4);
        let id = gone.conn_id;
        room.add(gone);
        drop(rx);

        let evicted = room.send_to(id, frame("x"), None, SlowConsumerPolicy::Tolerate {
            max_consecutive_drops: 10,
        });
        assert_eq!(evicted.map(|m| m.conn_id), Some(id));
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_encode_frame() {
        let frame = encode_frame(&Message::join("u", "U")).unwrap();
        assert!(frame.contains("\"type\":\"join\""));
    }
}
