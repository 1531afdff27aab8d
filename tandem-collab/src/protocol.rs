//! JSON wire protocol for document sessions.
//!
//! Every websocket frame carries one JSON object tagged by `type`:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────────┐
//! │ type     │ fields                                                   │
//! ├──────────┼──────────────────────────────────────────────────────────┤
//! │ content  │ content, workspaceId, userId, username, version, hash,   │
//! │          │ conflict                                                 │
//! │ join     │ userId, username                                         │
//! │ leave    │ userId, username                                         │
//! │ cursor   │ workspaceId, userId, username, position,                 │
//! │          │ selectionStart, selectionEnd                             │
//! │ users    │ users: [{ userId, username, cursorPosition? }]           │
//! └──────────┴──────────────────────────────────────────────────────────┘
//! ```
//!
//! Optional fields are omitted when empty. Peers only originate `content`
//! and `cursor` frames; the hub originates everything else.

use serde::{Deserialize, Deserializer, Serialize};

use crate::fingerprint::Fingerprint;

/// Message kinds, for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Content,
    Join,
    Leave,
    Cursor,
    Presence,
}

impl MessageKind {
    /// The `type` tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Content => "content",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Cursor => "cursor",
            MessageKind::Presence => "users",
        }
    }
}

/// One entry of a presence (`users`) frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<i64>,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Message {
    /// Full document text. Inbound it is an edit; outbound it is the
    /// authoritative state after an accepted edit, a rejected edit, or
    /// the initial sync.
    Content {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Inbound: the version the edit was based on. Outbound: the
        /// authoritative version.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(
            default,
            deserialize_with = "lenient_fingerprint",
            skip_serializing_if = "Option::is_none"
        )]
        hash: Option<Fingerprint>,
        /// Set on the state returned to an editor whose edit was rejected.
        #[serde(default, skip_serializing_if = "is_false")]
        conflict: bool,
    },

    Join {
        user_id: String,
        username: String,
    },

    Leave {
        user_id: String,
        username: String,
    },

    Cursor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        position: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection_start: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection_end: Option<i64>,
    },

    /// Snapshot of everyone attached to the document.
    #[serde(rename = "users")]
    Presence { users: Vec<UserInfo> },
}

impl Message {
    /// Authoritative document state for `workspace_id`.
    pub fn content(
        workspace_id: impl Into<String>,
        content: impl Into<String>,
        version: u64,
        hash: Fingerprint,
    ) -> Self {
        Message::Content {
            content: content.into(),
            workspace_id: Some(workspace_id.into()),
            user_id: None,
            username: None,
            version: Some(version),
            hash: Some(hash),
            conflict: false,
        }
    }

    /// An edit as a peer submits it.
    pub fn edit(content: impl Into<String>, version: u64, hash: Fingerprint) -> Self {
        Message::Content {
            content: content.into(),
            workspace_id: None,
            user_id: None,
            username: None,
            version: Some(version),
            hash: Some(hash),
            conflict: false,
        }
    }

    /// A cursor move as a peer submits it.
    pub fn cursor(position: i64, selection: Option<(i64, i64)>) -> Self {
        Message::Cursor {
            workspace_id: None,
            user_id: None,
            username: None,
            position,
            selection_start: selection.map(|(start, _)| start),
            selection_end: selection.map(|(_, end)| end),
        }
    }

    pub fn join(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Message::Join {
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    pub fn leave(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Message::Leave {
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    pub fn presence(users: Vec<UserInfo>) -> Self {
        Message::Presence { users }
    }

    /// Stamp the author's identity onto a `content` or `cursor` frame.
    ///
    /// Whatever identity the peer claimed is overwritten. Other kinds are
    /// returned unchanged.
    pub fn with_author(mut self, author_id: &str, author_name: &str, document_id: &str) -> Self {
        match &mut self {
            Message::Content {
                workspace_id,
                user_id,
                username,
                ..
            }
            | Message::Cursor {
                workspace_id,
                user_id,
                username,
                ..
            } => {
                *workspace_id = Some(document_id.to_string());
                *user_id = Some(author_id.to_string());
                *username = Some(author_name.to_string());
            }
            _ => {}
        }
        self
    }

    /// Flag a `content` frame as the answer to a rejected edit.
    pub fn into_conflict(mut self) -> Self {
        if let Message::Content { conflict, .. } = &mut self {
            *conflict = true;
        }
        self
    }

    /// Version and fingerprint carried by a `content` frame, if both are set.
    pub fn document_state(&self) -> Option<(u64, Fingerprint)> {
        match self {
            Message::Content {
                version: Some(version),
                hash: Some(hash),
                ..
            } => Some((*version, *hash)),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Content { .. } => MessageKind::Content,
            Message::Join { .. } => MessageKind::Join,
            Message::Leave { .. } => MessageKind::Leave,
            Message::Cursor { .. } => MessageKind::Cursor,
            Message::Presence { .. } => MessageKind::Presence,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// An absent or empty `hash` means "no fingerprint"; anything else must
/// parse.
fn lenient_fingerprint<'de, D>(deserializer: D) -> Result<Option<Fingerprint>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(hex) => Fingerprint::from_hex(hex)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
}
