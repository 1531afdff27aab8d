//! Durable storage consumed by the sync engine.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  get / create / CAS  ┌──────────────────┐
//! │ VersionStore │ ───────────────────► │                  │
//! └──────────────┘                      │  DocumentStore   │
//! ┌──────────────┐  update / snapshot   │  (trait object)  │
//! │ AutoSave     │ ───────────────────► │                  │
//! └──────────────┘                      └────────┬─────────┘
//!                                                │
//!                              ┌─────────────────┴──────────────┐
//!                              ▼                                ▼
//!                       ┌─────────────┐               ┌──────────────────┐
//!                       │ MemoryStore │               │ RocksStore       │
//!                       │ (tests/dev) │               │ CF "documents"   │
//!                       └─────────────┘               │ CF "metadata"    │
//!                                                     │ CF "history"     │
//!                                                     └──────────────────┘
//! ```
//!
//! The engine never reads history back; `append_snapshot` is a write-only
//! audit trail.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// The durable copy of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub version: u64,
    pub updated_at: SystemTime,
}

impl StoredDocument {
    /// A document at version 0 with no text.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            version: 0,
            updated_at: SystemTime::now(),
        }
    }
}

/// Persistence interface.
///
/// Implementations must be safe to call from many tasks at once;
/// `conditional_update_content` must be atomic with respect to other
/// writers of the same document.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch a document, `None` if it does not exist.
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Insert a new document. Fails with [`StoreError::AlreadyExists`] if
    /// the id is taken.
    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError>;

    /// Compare-and-swap on version: write `content` and bump the durable
    /// version to `expected_version + 1` only if it currently equals
    /// `expected_version`. Returns whether the write landed. A missing
    /// document is a mismatch, not an error.
    async fn conditional_update_content(
        &self,
        id: &str,
        content: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Overwrite content without touching the version.
    async fn update_content(&self, id: &str, content: &str) -> Result<(), StoreError>;

    /// Append `content` to the document's history log.
    async fn append_snapshot(&self, id: &str, content: &str) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let doc = StoredDocument::empty("doc1");
        assert_eq!(doc.id, "doc1");
        assert_eq!(doc.version, 0);
        assert!(doc.content.is_empty());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("doc1".into());
        assert!(err.to_string().contains("not found"));

        let err = StoreError::Database("test".into());
        assert!(err.to_string().contains("database error"));
    }
}
