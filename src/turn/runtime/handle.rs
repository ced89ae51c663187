use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use super::CoordinatorCommand;
use crate::billing::{BillingState, SyncError};
use crate::turn::constants::COORDINATOR_TARGET;
use crate::turn::types::{RejectReason, TurnEvent, TurnPhase};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("turn coordinator has stopped")]
    Stopped,
    #[error("final ledger flush failed: {0}")]
    Flush(SyncError),
}

/// Immediate result of a start-turn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { epoch: u64 },
    Busy { holder_id: String },
    Rejected(RejectReason),
}

/// Caller-side handle of a running coordinator. Dropping it stops the coordinator
/// after it releases any held lock and flushes pending billing.
pub struct TurnCoordinatorHandle {
    session_id: String,
    participant_id: String,
    command_tx: mpsc::Sender<CoordinatorCommand>,
    events_tx: broadcast::Sender<TurnEvent>,
    phase_rx: watch::Receiver<TurnPhase>,
    billing_rx: watch::Receiver<BillingState>,
    worker: Option<JoinHandle<()>>,
}

impl TurnCoordinatorHandle {
    pub(super) fn new(
        session_id: String,
        participant_id: String,
        command_tx: mpsc::Sender<CoordinatorCommand>,
        events_tx: broadcast::Sender<TurnEvent>,
        phase_rx: watch::Receiver<TurnPhase>,
        billing_rx: watch::Receiver<BillingState>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            command_tx,
            events_tx,
            phase_rx,
            billing_rx,
            worker: Some(worker),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
    ) -> Result<T, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        reply_rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Asks for the turn lock and starts listening. Contention is an outcome, not an error.
    pub async fn start_turn(&self) -> Result<StartOutcome, CoordinatorError> {
        self.request(CoordinatorCommand::StartTurn).await
    }

    /// Cancels the running turn, if any. Returns whether a turn was aborted.
    pub async fn abort(&self) -> Result<bool, CoordinatorError> {
        self.request(CoordinatorCommand::Abort).await
    }

    /// Credits an external top-up and settles outstanding billing.
    pub async fn top_up(&self, tokens: i64) -> Result<BillingState, CoordinatorError> {
        self.request(|reply| CoordinatorCommand::TopUp { tokens, reply })
            .await
    }

    /// Aborts any turn, flushes pending ledger entries and stops the coordinator.
    pub async fn shutdown(mut self) -> Result<usize, CoordinatorError> {
        let flushed = self.request(CoordinatorCommand::Shutdown).await?;
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                warn!(target: COORDINATOR_TARGET, %err, "turn coordinator task failed");
            }
        }
        flushed.map_err(CoordinatorError::Flush)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events_tx.subscribe()
    }

    pub fn phase(&self) -> TurnPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<TurnPhase> {
        self.phase_rx.clone()
    }

    pub fn billing(&self) -> BillingState {
        *self.billing_rx.borrow()
    }

    /// Waits until the phase satisfies `predicate`.
    pub async fn wait_for_phase<F>(&self, predicate: F) -> Result<TurnPhase, CoordinatorError>
    where
        F: Fn(&TurnPhase) -> bool,
    {
        let mut phases = self.phase_rx.clone();
        loop {
            let current = *phases.borrow_and_update();
            if predicate(&current) {
                return Ok(current);
            }
            phases
                .changed()
                .await
                .map_err(|_| CoordinatorError::Stopped)?;
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }
}
