//! Read-only presence directory.
//!
//! The hub actor is the only writer of room membership. After every
//! membership or cursor change it publishes a fresh snapshot of the room
//! here, so queries such as "how many people are in doc1?" are answered
//! from any task without going through the hub's mailbox.
//!
//! ```text
//!  Hub loop ──publish(doc, users)──► RwLock<HashMap<doc, Vec<UserInfo>>>
//!                                          ▲        ▲
//!                         member_count() ──┘        └── presence()
//! ```
//!
//! Readers see the state as of the last command the hub finished
//! processing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::UserInfo;

/// Snapshot view of every live room.
#[derive(Debug, Clone, Default)]
pub struct PresenceDirectory {
    rooms: Arc<RwLock<HashMap<String, Vec<UserInfo>>>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for `doc_id`. An empty list deletes the room.
    pub(crate) fn publish(&self, doc_id: &str, users: Vec<UserInfo>) {
        let mut rooms = self.rooms.write();
        if users.is_empty() {
            rooms.remove(doc_id);
        } else {
            rooms.insert(doc_id.to_string(), users);
        }
    }

    pub(crate) fn clear(&self) {
        self.rooms.write().clear();
    }

    /// Number of sessions attached to `doc_id` (0 if no room exists).
    pub fn member_count(&self, doc_id: &str) -> usize {
        self.rooms.read().get(doc_id).map_or(0, Vec::len)
    }

    /// Everyone attached to `doc_id`, in join order.
    pub fn presence(&self, doc_id: &str) -> Vec<UserInfo> {
        self.rooms.read().get(doc_id).cloned().unwrap_or_default()
    }

    pub fn has_room(&self, doc_id: &str) -> bool {
        self.rooms.read().contains_key(doc_id)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Ids of documents with at least one attached session, sorted.
    pub fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserInfo {
        UserInfo {
            user_id: id.into(),
            username: id.to_uppercase(),
            cursor_position: None,
        }
    }

    #[test]
    fn test_publish_and_query() {
        let dir = PresenceDirectory::new();
        assert_eq!(dir.member_count("doc1"), 0);
        assert!(!dir.has_room("doc1"));

        dir.publish("doc1", vec![user("c"), user("d")]);
        assert_eq!(dir.member_count("doc1"), 2);
        assert_eq!(dir.presence("doc1")[1].user_id, "d");
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn test_empty_snapshot_deletes_room() {
        let dir = PresenceDirectory::new();
        dir.publish("doc1", vec![user("c")]);
        dir.publish("doc1", Vec::new());
        assert!(!dir.has_room("doc1"));
        assert_eq!(dir.room_count(), 0);
        assert!(dir.presence("doc1").is_empty());
    }

    #[test]
    fn test_active_documents_sorted() {
        let dir = PresenceDirectory::new();
        dir.publish("zeta", vec![user("a")]);
        dir.publish("alpha", vec![user("b")]);
        assert_eq!(dir.active_documents(), vec!["alpha", "zeta"]);

        dir.clear();
        assert!(dir.active_documents().is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let dir = PresenceDirectory::new();
        let reader = dir.clone();
        dir.publish("doc1", vec![user("a")]);
        assert_eq!(reader.member_count("doc1"), 1);
    }
}
