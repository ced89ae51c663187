use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ChangeFeed, DocumentStore, LedgerStore, SessionChange, SessionDocument, StoreError};
use crate::billing::ledger::{LedgerHistory, PendingItem};

#[derive(Default)]
struct LedgerTables {
    items: Vec<PendingItem>,
    seen: HashSet<Uuid>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: Mutex<HashMap<String, SessionDocument>>,
    ledger: Mutex<LedgerTables>,
    feed: ChangeFeed,
    failing_ledger_writes: AtomicU32,
}

/// 进程内存储实现，语义与持久化后端一致。
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` ledger appends fail with a backend error.
    pub fn fail_next_ledger_writes(&self, count: u32) {
        self.inner
            .failing_ledger_writes
            .store(count, Ordering::SeqCst);
    }

    pub fn ledger_len(&self) -> usize {
        self.inner.ledger.lock().items.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .failing_ledger_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, mut document: SessionDocument) -> Result<SessionDocument, StoreError> {
        let stored = {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(&document.session_id) {
                return Err(StoreError::AlreadyExists(document.session_id));
            }
            document.version = 1;
            sessions.insert(document.session_id.clone(), document.clone());
            document
        };

        self.inner
            .feed
            .publish(SessionChange::Updated(stored.clone()));
        Ok(stored)
    }

    async fn read(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        Ok(self.inner.sessions.lock().get(session_id).cloned())
    }

    async fn compare_and_set(
        &self,
        mut document: SessionDocument,
        expected_version: u64,
    ) -> Result<SessionDocument, StoreError> {
        let stored = {
            let mut sessions = self.inner.sessions.lock();
            let current = sessions
                .get_mut(&document.session_id)
                .ok_or_else(|| StoreError::NotFound(document.session_id.clone()))?;

            if current.version != expected_version {
                return Err(StoreError::Conflict {
                    session_id: document.session_id.clone(),
                    expected: expected_version,
                    found: current.version,
                });
            }

            document.version = expected_version + 1;
            *current = document.clone();
            document
        };

        self.inner
            .feed
            .publish(SessionChange::Updated(stored.clone()));
        Ok(stored)
    }

    async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        let removed = self.inner.sessions.lock().remove(session_id).is_some();
        if removed {
            self.inner.feed.publish(SessionChange::Removed {
                session_id: session_id.to_string(),
            });
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<SessionDocument>, StoreError> {
        let mut documents: Vec<SessionDocument> =
            self.inner.sessions.lock().values().cloned().collect();
        documents.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(documents)
    }

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionChange> {
        self.inner.feed.subscribe(session_id)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append_batch(&self, batch: &[PendingItem]) -> Result<usize, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::backend("injected ledger write failure"));
        }

        let mut ledger = self.inner.ledger.lock();
        let mut written = 0;
        for item in batch {
            if ledger.seen.insert(item.entry_id()) {
                ledger.items.push(item.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn history(
        &self,
        participant_id: &str,
        session_kind: &str,
    ) -> Result<LedgerHistory, StoreError> {
        let ledger = self.inner.ledger.lock();
        let mut history = LedgerHistory::default();
        for item in &ledger.items {
            match item {
                PendingItem::Ledger(entry)
                    if entry.participant_id == participant_id
                        && entry.session_kind == session_kind =>
                {
                    history.entries.push(entry.clone());
                }
                PendingItem::Usage(delta)
                    if delta.participant_id == participant_id
                        && delta.session_kind == session_kind =>
                {
                    history.usage.push(delta.clone());
                }
                _ => {}
            }
        }
        Ok(history)
    }
}
