//! 发言锁：基于乐观并发事务的会话级互斥。

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::LockConfig;
use super::constants::LOCK_TARGET;
use crate::clock::Clock;
use crate::store::{transact, DocumentStore, LanguageTag, StoreError, TurnLock, TxStep};
use crate::telemetry::events::record_lock_contention;

/// Proof of holding a session's turn lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub session_id: String,
    pub holder_id: String,
    /// Fencing epoch assigned at acquisition.
    pub epoch: u64,
    pub acquired_at_ms: u64,
}

impl LockToken {
    fn matches(&self, lock: &TurnLock) -> bool {
        lock.holder_id == self.holder_id && lock.epoch == self.epoch
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("participant {holder_id} is speaking")]
    Busy { holder_id: String },
    #[error("{participant_id} is not a participant of session {session_id}")]
    NotParticipant {
        session_id: String,
        participant_id: String,
    },
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(session_id) => LockError::SessionNotFound(session_id),
            other => LockError::Store(other),
        }
    }
}

enum Acquisition {
    Granted {
        token: LockToken,
        reclaimed_from: Option<String>,
    },
    Busy(String),
    NotParticipant,
}

/// Acquires and releases the single speaking slot of a session.
#[derive(Clone)]
pub struct TurnLockManager {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl TurnLockManager {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Takes the lock if the session is free, or if the current holder's lock is stale.
    /// Never waits: a held lock yields [`LockError::Busy`].
    pub async fn acquire(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<LockToken, LockError> {
        let now = self.clock.now_ms();
        let stale_after_ms = self.config.stale_after_ms;

        let outcome = transact(
            self.store.as_ref(),
            session_id,
            self.config.max_transaction_attempts,
            |doc| {
                if !doc.is_participant(participant_id) {
                    return TxStep::Abort(Acquisition::NotParticipant);
                }

                let mut reclaimed_from = None;
                if let Some(lock) = &doc.turn_lock {
                    let stale = stale_after_ms
                        .map(|ttl| now.saturating_sub(lock.acquired_at_ms) >= ttl)
                        .unwrap_or(false);
                    if !stale {
                        return TxStep::Abort(Acquisition::Busy(lock.holder_id.clone()));
                    }
                    reclaimed_from = Some(lock.holder_id.clone());
                }

                doc.lock_epoch += 1;
                doc.turn_lock = Some(TurnLock {
                    holder_id: participant_id.to_string(),
                    utterance_text: String::new(),
                    utterance_final: false,
                    source_language: None,
                    acquired_at_ms: now,
                    epoch: doc.lock_epoch,
                });
                doc.updated_at_ms = now;

                TxStep::Commit(Acquisition::Granted {
                    token: LockToken {
                        session_id: doc.session_id.clone(),
                        holder_id: participant_id.to_string(),
                        epoch: doc.lock_epoch,
                        acquired_at_ms: now,
                    },
                    reclaimed_from,
                })
            },
        )
        .await;

        match outcome {
            Ok(Acquisition::Granted {
                token,
                reclaimed_from,
            }) => {
                if let Some(previous) = reclaimed_from {
                    warn!(
                        target: LOCK_TARGET,
                        session_id,
                        previous_holder = %previous,
                        holder_id = participant_id,
                        "reclaimed stale turn lock"
                    );
                }
                info!(
                    target: LOCK_TARGET,
                    session_id,
                    holder_id = participant_id,
                    epoch = token.epoch,
                    "turn lock acquired"
                );
                Ok(token)
            }
            Ok(Acquisition::Busy(holder_id)) => {
                record_lock_contention(session_id, participant_id, &holder_id);
                Err(LockError::Busy { holder_id })
            }
            Ok(Acquisition::NotParticipant) => Err(LockError::NotParticipant {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            }),
            Err(StoreError::Contended { .. }) => self.contended(session_id, participant_id).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Clears the lock only if it is still the one `token` was issued for.
    /// Returns `false` for a stale release, which is not an error.
    pub async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let released = transact(
            self.store.as_ref(),
            &token.session_id,
            self.config.max_transaction_attempts,
            |doc| match &doc.turn_lock {
                Some(lock) if token.matches(lock) => {
                    doc.turn_lock = None;
                    doc.updated_at_ms = now;
                    TxStep::Commit(true)
                }
                _ => TxStep::Abort(false),
            },
        )
        .await;

        match released {
            Ok(true) => {
                info!(
                    target: LOCK_TARGET,
                    session_id = %token.session_id,
                    holder_id = %token.holder_id,
                    epoch = token.epoch,
                    "turn lock released"
                );
                Ok(true)
            }
            Ok(false) | Err(StoreError::NotFound(_)) => {
                debug!(
                    target: LOCK_TARGET,
                    session_id = %token.session_id,
                    holder_id = %token.holder_id,
                    epoch = token.epoch,
                    "stale turn lock release ignored"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pushes the staleness deadline forward on a lock the caller still holds.
    /// `false` means the lock was released or reclaimed by someone else.
    pub async fn renew(&self, token: &LockToken) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let renewed = transact(
            self.store.as_ref(),
            &token.session_id,
            self.config.max_transaction_attempts,
            |doc| match doc.turn_lock.as_mut() {
                Some(lock) if token.matches(lock) => {
                    if lock.acquired_at_ms >= now {
                        return TxStep::Abort(true);
                    }
                    lock.acquired_at_ms = now;
                    TxStep::Commit(true)
                }
                _ => TxStep::Abort(false),
            },
        )
        .await;

        match renewed {
            Ok(true) => Ok(true),
            Ok(false) | Err(StoreError::NotFound(_)) => {
                warn!(
                    target: LOCK_TARGET,
                    session_id = %token.session_id,
                    holder_id = %token.holder_id,
                    epoch = token.epoch,
                    "turn lock lost before renewal"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Publishes recognized text on a lock the caller still holds. Also renews the lock.
    pub async fn update_utterance(
        &self,
        token: &LockToken,
        text: &str,
        is_final: bool,
        language: Option<&LanguageTag>,
    ) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let updated = transact(
            self.store.as_ref(),
            &token.session_id,
            self.config.max_transaction_attempts,
            |doc| match doc.turn_lock.as_mut() {
                Some(lock) if token.matches(lock) => {
                    if lock.utterance_text == text
                        && lock.utterance_final == is_final
                        && lock.source_language.as_ref() == language
                    {
                        return TxStep::Abort(true);
                    }
                    lock.utterance_text = text.to_string();
                    lock.utterance_final = is_final;
                    if language.is_some() {
                        lock.source_language = language.cloned();
                    }
                    lock.acquired_at_ms = now;
                    doc.updated_at_ms = now;
                    TxStep::Commit(true)
                }
                _ => TxStep::Abort(false),
            },
        )
        .await?;

        if !updated {
            debug!(
                target: LOCK_TARGET,
                session_id = %token.session_id,
                holder_id = %token.holder_id,
                "utterance update on a lock no longer held"
            );
        }
        Ok(updated)
    }

    /// Clears a lock held by `participant_id`, whatever its epoch.
    pub async fn force_release(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let released = transact(
            self.store.as_ref(),
            session_id,
            self.config.max_transaction_attempts,
            |doc| match &doc.turn_lock {
                Some(lock) if lock.holder_id == participant_id => {
                    doc.turn_lock = None;
                    doc.updated_at_ms = now;
                    TxStep::Commit(true)
                }
                _ => TxStep::Abort(false),
            },
        )
        .await;

        match released {
            Ok(true) => {
                warn!(
                    target: LOCK_TARGET,
                    session_id,
                    holder_id = participant_id,
                    "turn lock force-released"
                );
                Ok(true)
            }
            Ok(false) | Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn current(&self, session_id: &str) -> Result<Option<TurnLock>, LockError> {
        let document = self
            .store
            .read(session_id)
            .await?
            .ok_or_else(|| LockError::SessionNotFound(session_id.to_string()))?;
        Ok(document.turn_lock)
    }

    async fn contended(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<LockToken, LockError> {
        // 竞争失败方重新读取，报告当前持有者而不是继续重试。
        match self.current(session_id).await? {
            Some(lock) => {
                record_lock_contention(session_id, participant_id, &lock.holder_id);
                Err(LockError::Busy {
                    holder_id: lock.holder_id,
                })
            }
            None => Err(LockError::Store(StoreError::Contended {
                session_id: session_id.to_string(),
                attempts: self.config.max_transaction_attempts,
            })),
        }
    }
}
