//! # tandem-collab — Real-time collaborative text editing
//!
//! Provides a WebSocket sync engine: peers attached to the same document
//! see each other's edits, cursors and presence, conflicting edits are
//! rejected back to the loser, and content is persisted in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                       │
//! │ (per user)  │     JSON frames    │  session pumps (per connection)  │
//! └─────────────┘                    └────────────────┬─────────────────┘
//!                                                     │ HubCommand
//!                                                     ▼
//!                                    ┌──────────────────────────────────┐
//!                                    │ Hub (single actor)               │
//!                                    │  rooms ─ broadcast (try_send)    │
//!                                    │  auto-save scheduler             │
//!                                    └───────┬─────────────────┬────────┘
//!                                            │                 │
//!                                  ┌─────────▼───────┐  ┌──────▼────────────┐
//!                                  │ VersionStore    │  │ PresenceDirectory │
//!                                  │ (conflict check)│  │ (read path)       │
//!                                  └─────────┬───────┘  └───────────────────┘
//!                                            │
//!                                  ┌─────────▼───────┐
//!                                  │ DocumentStore   │
//!                                  │ memory | RocksDB│
//!                                  └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`fingerprint`] — 128-bit content digests
//! - [`protocol`] — JSON wire envelope
//! - [`version`] — Authoritative state and optimistic conflict resolution
//! - [`broadcast`] — Room membership and non-blocking fan-out
//! - [`presence`] — Concurrent read path for room membership
//! - [`autosave`] — Debounced persistence of edited documents
//! - [`hub`] — Room registry actor
//! - [`session`] — Per-connection inbound/outbound pumps
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client
//! - [`storage`] — Persistence interface, in-memory and RocksDB stores

pub mod autosave;
pub mod broadcast;
pub mod client;
pub mod fingerprint;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod version;

// Re-exports for convenience
pub use autosave::{AutoSaveScheduler, FlushJob, FlushResult};
pub use broadcast::{BroadcastStats, SlowConsumerPolicy};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use fingerprint::{fingerprint, Fingerprint};
pub use hub::{Hub, HubConfig, HubError, HubHandle, Registration};
pub use presence::PresenceDirectory;
pub use protocol::{Message, MessageKind, ProtocolError, UserInfo};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError,
    StoredDocument,
};
pub use version::{DocumentState, UpdateOutcome, VersionStore};
