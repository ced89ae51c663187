//! 持久化存储层：会话文档的乐观并发读写与账本追加。

mod document;
mod memory;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

pub use document::{LanguageTag, Participant, SessionDocument, TurnLock};
pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::billing::ledger::{LedgerHistory, PendingItem};

const CHANGE_FEED_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("version conflict on session {session_id}: expected {expected}, found {found}")]
    Conflict {
        session_id: String,
        expected: u64,
        found: u64,
    },
    #[error("transaction on session {session_id} still conflicting after {attempts} attempts")]
    Contended { session_id: String, attempts: u8 },
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }
}

/// 会话文档变更通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Updated(SessionDocument),
    Removed { session_id: String },
}

impl SessionChange {
    pub fn session_id(&self) -> &str {
        match self {
            SessionChange::Updated(document) => &document.session_id,
            SessionChange::Removed { session_id } => session_id,
        }
    }
}

/// Versioned session documents with compare-and-set commits.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores a new document at version 1.
    async fn insert(&self, document: SessionDocument) -> Result<SessionDocument, StoreError>;

    async fn read(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError>;

    /// Commits `document` only if the stored version still equals `expected_version`.
    async fn compare_and_set(
        &self,
        document: SessionDocument,
        expected_version: u64,
    ) -> Result<SessionDocument, StoreError>;

    async fn remove(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<SessionDocument>, StoreError>;

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionChange>;
}

/// Append-only ledger persistence.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends the batch atomically. Items already stored (same entry id) are skipped;
    /// returns the number of newly written items.
    async fn append_batch(&self, batch: &[PendingItem]) -> Result<usize, StoreError>;

    async fn history(
        &self,
        participant_id: &str,
        session_kind: &str,
    ) -> Result<LedgerHistory, StoreError>;
}

/// 事务回调的决定：提交修改后的文档，或放弃写入直接返回结果。
#[derive(Debug)]
pub enum TxStep<R> {
    Commit(R),
    Abort(R),
}

/// Read-modify-write against one session document.
///
/// `apply` runs on a fresh copy of the document for every attempt; a version
/// conflict re-reads and re-runs it, up to `max_attempts` times.
pub async fn transact<S, R, F>(
    store: &S,
    session_id: &str,
    max_attempts: u8,
    mut apply: F,
) -> Result<R, StoreError>
where
    S: DocumentStore + ?Sized,
    R: Send,
    F: FnMut(&mut SessionDocument) -> TxStep<R> + Send,
{
    let max_attempts = max_attempts.max(1);
    let mut attempts: u8 = 0;

    loop {
        attempts = attempts.saturating_add(1);

        let current = store
            .read(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let expected = current.version;
        let mut draft = current;

        let result = match apply(&mut draft) {
            TxStep::Abort(result) => return Ok(result),
            TxStep::Commit(result) => result,
        };

        match store.compare_and_set(draft, expected).await {
            Ok(_) => return Ok(result),
            Err(StoreError::Conflict { found, .. }) if attempts < max_attempts => {
                debug!(
                    target: "store",
                    session_id,
                    expected,
                    found,
                    attempts,
                    "session transaction conflicted, retrying"
                );
            }
            Err(StoreError::Conflict { .. }) => {
                return Err(StoreError::Contended {
                    session_id: session_id.to_string(),
                    attempts,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

/// Per-session broadcast channels shared by the store implementations.
#[derive(Default)]
pub(crate) struct ChangeFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<SessionChange>>>,
}

impl ChangeFeed {
    pub(crate) fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionChange> {
        let mut channels = self.channels.lock();
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_FEED_CAPACITY).0)
            .subscribe()
    }

    pub(crate) fn publish(&self, change: SessionChange) {
        let mut channels = self.channels.lock();
        let session_id = change.session_id().to_string();
        let removed = matches!(change, SessionChange::Removed { .. });

        if let Some(sender) = channels.get(&session_id) {
            // 没有订阅者时发送失败是正常情况。
            let _ = sender.send(change);
        }

        if removed {
            channels.remove(&session_id);
        }
    }
}
