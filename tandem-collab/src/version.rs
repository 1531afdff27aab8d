//! Authoritative document state and optimistic conflict resolution.
//!
//! Architecture:
//! ```text
//!                 update_content(doc, text, v, fp)
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────┐
//! │ VersionStore                                           │
//! │  RwLock<HashMap<doc_id, Arc<DocumentEntry>>>           │
//! │                                                        │
//! │  DocumentEntry ── Mutex<DocumentState>   (per document)│
//! │        │                                               │
//! │        └── write queue ──► writer task ──► DocumentStore
//! │                              (CAS on pre-increment     │
//! │                               version, rollback on     │
//! │                               failure)                 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! An edit is rejected when the client's view is stale: its version is
//! behind, or equal but with a different fingerprint. Rejection returns the
//! current state so the client can rebase.
//!
//! Accepted edits are written through asynchronously. Each document has
//! its own writer task fed in accept order, so a slow store only delays
//! that document's writes. When a durable compare-and-swap fails the
//! in-memory version is decremented by one; the in-memory content is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::fingerprint::Fingerprint;
use crate::storage::{DocumentStore, StoreError, StoredDocument};

/// In-memory state of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub content: String,
    pub version: u64,
    pub fingerprint: Fingerprint,
    pub last_updated: SystemTime,
}

impl DocumentState {
    fn from_stored(doc: StoredDocument) -> Self {
        Self {
            fingerprint: Fingerprint::of(&doc.content),
            content: doc.content,
            version: doc.version,
            last_updated: doc.updated_at,
        }
    }
}

/// Result of [`VersionStore::update_content`].
///
/// Carries the authoritative state after the call whether or not the edit
/// was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub accepted: bool,
    pub version: u64,
    pub fingerprint: Fingerprint,
    pub content: String,
}

/// Version store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("document {0} has not been loaded")]
    NotLoaded(String),
}

/// Counters for monitoring conflict rates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionStats {
    pub accepted: u64,
    pub rejected: u64,
    pub rollbacks: u64,
}

#[derive(Default)]
struct AtomicVersionStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    rollbacks: AtomicU64,
}

enum WriteJob {
    Persist {
        content: String,
        expected_version: u64,
    },
    /// Completes once every job queued before it has been processed.
    Barrier(oneshot::Sender<()>),
}

struct DocumentEntry {
    state: Arc<Mutex<DocumentState>>,
    writes: mpsc::UnboundedSender<WriteJob>,
}

/// Per-document authoritative state.
pub struct VersionStore {
    store: Arc<dyn DocumentStore>,
    documents: RwLock<HashMap<String, Arc<DocumentEntry>>>,
    stats: Arc<AtomicVersionStats>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            documents: RwLock::new(HashMap::new()),
            stats: Arc::new(AtomicVersionStats::default()),
        }
    }

    /// The persistence backend.
    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Return the document, loading it from persistence on first access.
    ///
    /// A document the store has never seen is created durably at version 0
    /// with empty content.
    pub async fn load(&self, doc_id: &str) -> Result<DocumentState, StoreError> {
        if let Some(state) = self.peek(doc_id) {
            return Ok(state);
        }

        let doc = match self.store.get(doc_id).await? {
            Some(doc) => doc,
            None => {
                let doc = StoredDocument::empty(doc_id);
                match self.store.create(doc.clone()).await {
                    Ok(()) => {
                        log::info!("Created document {doc_id}");
                        doc
                    }
                    // Lost a creation race with another process or task
                    Err(StoreError::AlreadyExists(_)) => self
                        .store
                        .get(doc_id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?,
                    Err(e) => return Err(e),
                }
            }
        };

        let entry = self.get_or_insert(doc_id, doc);
        let state = entry.state.lock().clone();
        Ok(state)
    }

    /// Current state of a loaded document, without touching persistence.
    pub fn peek(&self, doc_id: &str) -> Option<DocumentState> {
        self.documents
            .read()
            .get(doc_id)
            .map(|entry| entry.state.lock().clone())
    }

    /// Apply an edit if the client's view is current.
    ///
    /// Edits to the same document are serialised by that document's lock;
    /// different documents never contend. The durable write is queued and
    /// never awaited here.
    pub fn update_content(
        &self,
        doc_id: &str,
        content: String,
        client_version: u64,
        client_fingerprint: Fingerprint,
    ) -> Result<UpdateOutcome, VersionError> {
        let entry = self
            .entry(doc_id)
            .ok_or_else(|| VersionError::NotLoaded(doc_id.to_string()))?;

        let mut state = entry.state.lock();

        let stale = client_version < state.version
            || (client_version == state.version && client_fingerprint != state.fingerprint);
        if stale {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Rejected edit to {doc_id}: client v{client_version}, current v{}",
                state.version
            );
            return Ok(UpdateOutcome {
                accepted: false,
                version: state.version,
                fingerprint: state.fingerprint,
                content: state.content.clone(),
            });
        }

        let expected_version = state.version;
        state.fingerprint = Fingerprint::of(&content);
        state.content = content;
        state.version += 1;
        state.last_updated = SystemTime::now();
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        // Queued under the document lock so the writer sees accept order
        let job = WriteJob::Persist {
            content: state.content.clone(),
            expected_version,
        };
        if entry.writes.send(job).is_err() {
            log::error!("Write-through queue for {doc_id} is closed");
        }

        Ok(UpdateOutcome {
            accepted: true,
            version: state.version,
            fingerprint: state.fingerprint,
            content: state.content.clone(),
        })
    }

    /// Wait until every write queued for `doc_id` so far has been attempted.
    pub async fn wait_for_writes(&self, doc_id: &str) {
        let Some(entry) = self.entry(doc_id) else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if entry.writes.send(WriteJob::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// [`wait_for_writes`](Self::wait_for_writes) for every loaded document.
    pub async fn wait_for_all_writes(&self) {
        let ids: Vec<String> = self.documents.read().keys().cloned().collect();
        for id in ids {
            self.wait_for_writes(&id).await;
        }
    }

    /// Number of documents held in memory.
    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    pub fn stats(&self) -> VersionStats {
        VersionStats {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            rollbacks: self.stats.rollbacks.load(Ordering::Relaxed),
        }
    }

    fn entry(&self, doc_id: &str) -> Option<Arc<DocumentEntry>> {
        self.documents.read().get(doc_id).cloned()
    }

    fn get_or_insert(&self, doc_id: &str, doc: StoredDocument) -> Arc<DocumentEntry> {
        // Fast path: read lock
        if let Some(entry) = self.entry(doc_id) {
            return entry;
        }

        let mut documents = self.documents.write();
        // Double-check after acquiring write lock
        if let Some(entry) = documents.get(doc_id) {
            return entry.clone();
        }

        let state = Arc::new(Mutex::new(DocumentState::from_stored(doc)));
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_through(
            doc_id.to_string(),
            self.store.clone(),
            state.clone(),
            self.stats.clone(),
            rx,
        ));

        let entry = Arc::new(DocumentEntry { state, writes });
        documents.insert(doc_id.to_string(), entry.clone());
        entry
    }
}

/// Drains one document's write queue in order.
///
/// Ends when the owning entry is dropped.
async fn write_through(
    doc_id: String,
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<DocumentState>>,
    stats: Arc<AtomicVersionStats>,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Persist {
                content,
                expected_version,
            } => {
                let failure = match store
                    .conditional_update_content(&doc_id, &content, expected_version)
                    .await
                {
                    Ok(true) => None,
                    Ok(false) => Some("durable version mismatch".to_string()),
                    Err(e) => Some(e.to_string()),
                };

                if let Some(reason) = failure {
                    let mut state = state.lock();
                    state.version = state.version.saturating_sub(1);
                    stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Write-through of {doc_id} at v{expected_version} failed ({reason}); \
                         in-memory version rolled back to {}",
                        state.version
                    );
                }
            }
            WriteJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    log::trace!("Write-through task for {doc_id} finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    /// Store whose conditional writes always fail.
    struct FailingStore {
        inner: MemoryStore,
        error: bool,
    }

    #[async_trait]
    impl DocumentStore for FailingStore {
        async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.get(id).await
        }
        async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
            self.inner.create(doc).await
        }
        async fn conditional_update_content(
            &self,
            _id: &str,
            _content: &str,
            _expected_version: u64,
        ) -> Result<bool, StoreError> {
            if self.error {
                Err(StoreError::Io("disk unplugged".into()))
            } else {
                Ok(false)
            }
        }
        async fn update_content(&self, id: &str, content: &str) -> Result<(), StoreError> {
            self.inner.update_content(id, content).await
        }
        async fn append_snapshot(&self, id: &str, content: &str) -> Result<(), StoreError> {
            self.inner.append_snapshot(id, content).await
        }
    }

    fn memory_versions() -> (Arc<MemoryStore>, VersionStore) {
        let store = Arc::new(MemoryStore::new());
        let versions = VersionStore::new(store.clone());
        (store, versions)
    }

    #[tokio::test]
    async fn test_load_creates_absent_document() {
        let (store, versions) = memory_versions();

        let state = versions.load("doc1").await.unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(state.content, "");
        assert_eq!(state.fingerprint, fingerprint(""));

        // Created durably so conditional writes can land
        assert_eq!(store.document("doc1").unwrap().version, 0);
        assert_eq!(versions.document_count(), 1);
    }

    #[tokio::test]
    async fn test_load_existing_document() {
        let mut doc = StoredDocument::empty("doc1");
        doc.content = "stored text".into();
        doc.version = 4;
        let store = Arc::new(MemoryStore::with_documents([doc]));
        let versions = VersionStore::new(store);

        let state = versions.load("doc1").await.unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.content, "stored text");
        assert_eq!(state.fingerprint, fingerprint("stored text"));
        assert_eq!(versions.peek("doc1"), Some(state));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (store, versions) = memory_versions();
        versions.load("doc1").await.unwrap();

        let empty = fingerprint("");
        let first = versions
            .update_content("doc1", "Hello".into(), 0, empty)
            .unwrap();
        assert!(first.accepted);
        assert_eq!(first.version, 1);
        assert_eq!(first.content, "Hello");
        assert_eq!(first.fingerprint, fingerprint("Hello"));

        let second = versions
            .update_content("doc1", "World".into(), 0, empty)
            .unwrap();
        assert!(!second.accepted);
        assert_eq!(second.version, 1);
        assert_eq!(second.content, "Hello");
        assert_eq!(second.fingerprint, fingerprint("Hello"));

        versions.wait_for_writes("doc1").await;
        let durable = store.document("doc1").unwrap();
        assert_eq!(durable.content, "Hello");
        assert_eq!(durable.version, 1);

        let stats = versions.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rollbacks, 0);
    }

    #[tokio::test]
    async fn test_same_version_different_fingerprint_rejected() {
        let (_store, versions) = memory_versions();
        versions.load("doc1").await.unwrap();

        let outcome = versions
            .update_content("doc1", "edit".into(), 0, fingerprint("something else"))
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.version, 0);
    }

    #[tokio::test]
    async fn test_rebased_edit_accepted() {
        let (store, versions) = memory_versions();
        versions.load("doc1").await.unwrap();

        let mut version = 0;
        let mut fp = fingerprint("");
        for i in 0..10 {
            let text = format!("revision {i}");
            let outcome = versions
                .update_content("doc1", text.clone(), version, fp)
                .unwrap();
            assert!(outcome.accepted);
            assert_eq!(outcome.version, version + 1);
            version = outcome.version;
            fp = outcome.fingerprint;
        }

        versions.wait_for_writes("doc1").await;
        let durable = store.document("doc1").unwrap();
        assert_eq!(durable.version, 10);
        assert_eq!(durable.content, "revision 9");
    }

    #[tokio::test]
    async fn test_ahead_of_server_is_accepted() {
        let (_store, versions) = memory_versions();
        versions.load("doc1").await.unwrap();

        let outcome = versions
            .update_content("doc1", "x".into(), 5, fingerprint("whatever"))
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_single_accept() {
        let (_store, versions) = memory_versions();
        versions.load("doc1").await.unwrap();
        let empty = fingerprint("");

        let accepted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let versions = &versions;
                    s.spawn(move || {
                        versions
                            .update_content("doc1", format!("writer {i}"), 0, empty)
                            .unwrap()
                            .accepted as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(accepted, 1);
        assert_eq!(versions.peek("doc1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_rollback_on_version_mismatch() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            error: false,
        });
        let versions = VersionStore::new(store);
        versions.load("doc1").await.unwrap();

        let outcome = versions
            .update_content("doc1", "Hello".into(), 0, fingerprint(""))
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.version, 1);

        versions.wait_for_writes("doc1").await;
        let state = versions.peek("doc1").unwrap();
        assert_eq!(state.version, 0);
        // Content is not reverted
        assert_eq!(state.content, "Hello");
        assert_eq!(versions.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_rollback_on_store_error() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            error: true,
        });
        let versions = VersionStore::new(store);
        versions.load("doc1").await.unwrap();

        versions
            .update_content("doc1", "Hello".into(), 0, fingerprint(""))
            .unwrap();
        versions.wait_for_writes("doc1").await;
        assert_eq!(versions.peek("doc1").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_independent_documents() {
        let (_store, versions) = memory_versions();
        versions.load("a").await.unwrap();
        versions.load("b").await.unwrap();

        let empty = fingerprint("");
        assert!(versions.update_content("a", "A".into(), 0, empty).unwrap().accepted);
        assert!(versions.update_content("b", "B".into(), 0, empty).unwrap().accepted);
        assert_eq!(versions.peek("a").unwrap().content, "A");
        assert_eq!(versions.peek("b").unwrap().content, "B");
    }

    #[tokio::test]
    async fn test_update_unloaded_document() {
        let (_store, versions) = memory_versions();
        let result = versions.update_content("ghost", "x".into(), 0, fingerprint(""));
        assert_eq!(result, Err(VersionError::NotLoaded("ghost".into())));
        assert!(versions.peek("ghost").is_none());
    }
}
