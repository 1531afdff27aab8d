//! In-process document store.
//!
//! Keeps everything in a mutex-guarded map. Used by tests and by the
//! server when started with `STORAGE=memory`.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocumentStore, StoreError, StoredDocument};

#[derive(Debug)]
struct Entry {
    doc: StoredDocument,
    history: Vec<String>,
}

/// Map-backed [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `docs`.
    pub fn with_documents(docs: impl IntoIterator<Item = StoredDocument>) -> Self {
        let map = docs
            .into_iter()
            .map(|doc| {
                (
                    doc.id.clone(),
                    Entry {
                        doc,
                        history: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            docs: Mutex::new(map),
        }
    }

    /// Current durable copy of a document.
    pub fn document(&self, id: &str) -> Option<StoredDocument> {
        self.docs.lock().get(id).map(|e| e.doc.clone())
    }

    /// Snapshots appended for a document, oldest first.
    pub fn history(&self, id: &str) -> Vec<String> {
        self.docs
            .lock()
            .get(id)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.document(id))
    }

    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
        let mut docs = self.docs.lock();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        docs.insert(
            doc.id.clone(),
            Entry {
                doc,
                history: Vec::new(),
            },
        );
        Ok(())
    }

    async fn conditional_update_content(
        &self,
        id: &str,
        content: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut docs = self.docs.lock();
        match docs.get_mut(id) {
            Some(entry) if entry.doc.version == expected_version => {
                entry.doc.content = content.to_string();
                entry.doc.version += 1;
                entry.doc.updated_at = SystemTime::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_content(&self, id: &str, content: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock();
        let entry = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.doc.content = content.to_string();
        entry.doc.updated_at = SystemTime::now();
        Ok(())
    }

    async fn append_snapshot(&self, id: &str, content: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock();
        let entry = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.history.push(content.to_string());
        Ok(())
    }
}
