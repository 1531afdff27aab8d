//! Debounced persistence of edited documents.
//!
//! The hub records every accepted edit as a dirty entry (one per document,
//! replaced on each edit). On each tick the scheduler selects the entries
//! edited within the trailing window and the hub writes them out on a
//! detached task; results come back through the hub's mailbox.
//!
//! ```text
//!   edit ──► mark_dirty(doc, text, t)
//!
//!   tick(now) ──► due(now) ──► [edited_at >= now - window] ──► flush()
//!                                                               │
//!   complete(doc, edited_at, ok) ◄──── FlushComplete ◄──────────┘
//! ```
//!
//! Entries outside the window stay dirty. A failed flush stays dirty and is
//! retried by a later tick that still finds it inside the window. A
//! successful flush clears the entry only if no newer edit replaced it in
//! the meantime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::storage::DocumentStore;

/// An edit not yet flushed to durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry {
    pub pending_content: String,
    pub edited_at: Instant,
    in_flight: bool,
}

/// One write selected by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushJob {
    pub document_id: String,
    pub content: String,
    pub edited_at: Instant,
}

/// Outcome of one [`FlushJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    pub document_id: String,
    pub edited_at: Instant,
    pub ok: bool,
}

/// Dirty-entry bookkeeping. Owned by the hub loop.
#[derive(Debug)]
pub struct AutoSaveScheduler {
    entries: HashMap<String, DirtyEntry>,
    window: Duration,
}

impl AutoSaveScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    /// Record `content` as the latest unsaved text of `doc_id`.
    pub fn mark_dirty(&mut self, doc_id: &str, content: String, at: Instant) {
        self.entries.insert(
            doc_id.to_string(),
            DirtyEntry {
                pending_content: content,
                edited_at: at,
                in_flight: false,
            },
        );
    }

    /// Select entries edited within the window ending at `now`.
    ///
    /// Selected entries are marked in flight and are not selected again
    /// until [`complete`](Self::complete) reports back, so two writes of
    /// the same document never overlap.
    pub fn due(&mut self, now: Instant) -> Vec<FlushJob> {
        // Before the process has been up for a full window every entry is recent
        let cutoff = now.checked_sub(self.window);

        let mut jobs = Vec::new();
        for (doc_id, entry) in &mut self.entries {
            if entry.in_flight {
                continue;
            }
            let recent = cutoff.map_or(true, |cutoff| entry.edited_at >= cutoff);
            if !recent {
                log::trace!("Skipping stale dirty entry for {doc_id}");
                continue;
            }
            entry.in_flight = true;
            jobs.push(FlushJob {
                document_id: doc_id.clone(),
                content: entry.pending_content.clone(),
                edited_at: entry.edited_at,
            });
        }
        jobs
    }

    /// Apply a flush result. Returns true if the entry was cleared.
    pub fn complete(&mut self, result: &FlushResult) -> bool {
        let Some(entry) = self.entries.get_mut(&result.document_id) else {
            return false;
        };
        if entry.edited_at != result.edited_at {
            // Superseded by a newer edit; that one is not in flight
            return false;
        }
        if result.ok {
            self.entries.remove(&result.document_id);
            true
        } else {
            entry.in_flight = false;
            false
        }
    }

    /// Take every entry regardless of window, leaving the scheduler empty.
    pub fn drain_all(&mut self) -> Vec<FlushJob> {
        self.entries
            .drain()
            .map(|(document_id, entry)| FlushJob {
                document_id,
                content: entry.pending_content,
                edited_at: entry.edited_at,
            })
            .collect()
    }

    pub fn is_dirty(&self, doc_id: &str) -> bool {
        self.entries.contains_key(doc_id)
    }

    pub fn get(&self, doc_id: &str) -> Option<&DirtyEntry> {
        self.entries.get(doc_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write each job's content, optionally appending a history snapshot.
///
/// Failures are logged and reported, never retried here.
pub async fn flush(store: &dyn DocumentStore, jobs: Vec<FlushJob>, snapshot: bool) -> Vec<FlushResult> {
    let mut results = Vec::with_capacity(jobs.len());

    for job in jobs {
        let ok = match store.update_content(&job.document_id, &job.content).await {
            Ok(()) => {
                log::info!(
                    "Auto-saved {} ({} bytes)",
                    job.document_id,
                    job.content.len()
                );
                if snapshot {
                    if let Err(e) = store.append_snapshot(&job.document_id, &job.content).await {
                        log::warn!("Snapshot of {} failed: {e}", job.document_id);
                    }
                }
                true
            }
            Err(e) => {
                log::error!("Auto-save of {} failed: {e}", job.document_id);
                false
            }
        };

        results.push(FlushResult {
            document_id: job.document_id,
            edited_at: job.edited_at,
            ok,
        });
    }

    results
}
