//! 会话管理：房间的创建、加入、离开与回收，以及为本地参与者启动轮次协调器。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::billing::{BillingState, LedgerFlusher, PendingSyncQueue, UsageMeter};
use crate::clock::Clock;
use crate::services::{
    AudioPlayer, IdentityProvider, SpeechRecognizer, SpeechSynthesizer, Translator,
};
use crate::store::{
    transact, DocumentStore, LedgerStore, Participant, SessionDocument, StoreError, TxStep,
};
use crate::turn::{
    retry_bounded, spawn_coordinator, CoordinatorConfig, CoordinatorDeps, ParticipantContext,
    TurnCoordinatorHandle,
};

const SESSION_TARGET: &str = "session_manager";

/// Local speech devices and remote speech services of this client.
#[derive(Clone)]
pub struct SpeechServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
}

pub struct SessionManager {
    config: CoordinatorConfig,
    store: Arc<dyn DocumentStore>,
    ledger: Arc<dyn LedgerStore>,
    identity: Arc<dyn IdentityProvider>,
    services: SpeechServices,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn DocumentStore>,
        ledger: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityProvider>,
        services: SpeechServices,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            identity,
            services,
            clock,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Creates a room with a fresh id.
    pub async fn open(&self, participants: Vec<Participant>) -> Result<SessionDocument> {
        let session_id = Uuid::new_v4().to_string();
        self.open_with_id(&session_id, participants).await
    }

    pub async fn open_with_id(
        &self,
        session_id: &str,
        participants: Vec<Participant>,
    ) -> Result<SessionDocument> {
        let document = SessionDocument::new(session_id, participants, self.clock.now_ms());
        let stored = self
            .store
            .insert(document)
            .await
            .with_context(|| format!("failed to open session {session_id}"))?;

        info!(
            target: SESSION_TARGET,
            session_id,
            participants = stored.participants.len(),
            "session opened"
        );
        Ok(stored)
    }

    /// Adds or updates a participant. Tolerates a session that is not visible yet.
    pub async fn join(&self, session_id: &str, participant: Participant) -> Result<SessionDocument> {
        let now = self.clock.now_ms();
        let attempts = self.config.lock.max_transaction_attempts;
        let participant_id = participant.participant_id.clone();

        let outcome = retry_bounded(self.config.retry, |_| {
            let participant = participant.clone();
            async move {
                transact(self.store.as_ref(), session_id, attempts, move |doc| {
                    if doc.upsert_participant(participant.clone()) {
                        doc.updated_at_ms = now;
                        TxStep::Commit(())
                    } else {
                        TxStep::Abort(())
                    }
                })
                .await
            }
        })
        .await;

        let attempts_used = outcome.attempts();
        outcome
            .into_result()
            .with_context(|| format!("failed to join session {session_id}"))?;

        info!(
            target: SESSION_TARGET,
            session_id,
            participant_id = %participant_id,
            attempts = attempts_used,
            "participant joined"
        );
        self.require(session_id).await
    }

    /// Removes a participant and clears the turn lock if they held it.
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let left = transact(
            self.store.as_ref(),
            session_id,
            self.config.lock.max_transaction_attempts,
            |doc| {
                if !doc.remove_participant(participant_id) {
                    return TxStep::Abort(false);
                }
                if doc.lock_holder() == Some(participant_id) {
                    doc.turn_lock = None;
                }
                doc.updated_at_ms = now;
                TxStep::Commit(true)
            },
        )
        .await;

        match left {
            Ok(left) => {
                if left {
                    info!(target: SESSION_TARGET, session_id, participant_id, "participant left");
                }
                Ok(left)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to leave session {session_id}")),
        }
    }

    /// Deletes the room. Running coordinators observe the removal and stop.
    pub async fn end(&self, session_id: &str) -> Result<bool> {
        let removed = self
            .store
            .remove(session_id)
            .await
            .with_context(|| format!("failed to end session {session_id}"))?;
        if removed {
            info!(target: SESSION_TARGET, session_id, "session ended");
        }
        Ok(removed)
    }

    /// Ends rooms untouched for `max_idle` whose turn lock is free. Returns their ids.
    pub async fn expire_idle(&self, max_idle: Duration) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let max_idle_ms = max_idle.as_millis().min(u64::MAX as u128) as u64;
        let documents = self
            .store
            .list()
            .await
            .context("failed to list sessions")?;

        let mut expired = Vec::new();
        for document in documents {
            let idle_ms = now.saturating_sub(document.updated_at_ms);
            if idle_ms < max_idle_ms {
                continue;
            }
            if document.turn_lock.is_some() {
                debug!(
                    target: SESSION_TARGET,
                    session_id = %document.session_id,
                    "idle session still has a turn lock, keeping it"
                );
                continue;
            }

            match self.store.remove(&document.session_id).await {
                Ok(true) => {
                    info!(
                        target: SESSION_TARGET,
                        session_id = %document.session_id,
                        idle_ms,
                        "idle session expired"
                    );
                    expired.push(document.session_id);
                }
                Ok(false) => {}
                Err(err) => warn!(
                    target: SESSION_TARGET,
                    session_id = %document.session_id,
                    %err,
                    "failed to expire idle session"
                ),
            }
        }
        Ok(expired)
    }

    /// Restores billing from the ledger and spawns the coordinator for a local participant.
    pub async fn start_coordinator(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<TurnCoordinatorHandle> {
        let profile = self
            .identity
            .profile(participant_id)
            .await
            .with_context(|| format!("failed to load profile of {participant_id}"))?;

        let document = retry_bounded(self.config.retry, |_| async move {
            match self.store.read(session_id).await {
                Ok(Some(document)) => Ok(document),
                Ok(None) => Err(StoreError::NotFound(session_id.to_string())),
                Err(err) => Err(err),
            }
        })
        .await
        .into_result()
        .with_context(|| format!("session {session_id} is not available"))?;

        let Some(member) = document.participant(participant_id) else {
            bail!("{participant_id} is not a participant of session {session_id}");
        };
        let language = if member.language.is_empty() {
            profile.language.clone()
        } else {
            member.language.clone()
        };

        let billing = &self.config.billing;
        let history = self
            .ledger
            .history(participant_id, &billing.session_kind)
            .await
            .with_context(|| format!("failed to read ledger of {participant_id}"))?;

        let queue = Arc::new(PendingSyncQueue::new());
        let (flusher, _task) = LedgerFlusher::spawn(
            participant_id,
            Arc::clone(&queue),
            Arc::clone(&self.ledger),
            self.config.sync.clone(),
        );

        let mut meter = UsageMeter::new(
            participant_id,
            billing.clone(),
            BillingState::with_balance(profile.balance),
            queue,
            Arc::clone(&self.clock),
        )
        .with_flusher(flusher.clone());
        if history.is_empty() {
            meter.record_opening_grant();
        } else {
            // 账本为准，身份服务给出的余额只是提示。
            meter.reconcile(&history);
        }

        info!(
            target: SESSION_TARGET,
            session_id,
            participant_id,
            language = %language,
            balance = meter.state().local_balance,
            restored = !history.is_empty(),
            "starting turn coordinator"
        );

        let deps = CoordinatorDeps {
            store: Arc::clone(&self.store),
            recognizer: Arc::clone(&self.services.recognizer),
            translator: Arc::clone(&self.services.translator),
            synthesizer: Arc::clone(&self.services.synthesizer),
            player: Arc::clone(&self.services.player),
            clock: Arc::clone(&self.clock),
        };

        Ok(spawn_coordinator(
            self.config.clone(),
            deps,
            ParticipantContext {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                language,
            },
            document,
            meter,
            Some(flusher),
        ))
    }

    async fn require(&self, session_id: &str) -> Result<SessionDocument> {
        self.store
            .read(session_id)
            .await
            .with_context(|| format!("failed to read session {session_id}"))?
            .ok_or_else(|| anyhow!("session {session_id} not found"))
    }
}

#[cfg(test)]
mod tests;
