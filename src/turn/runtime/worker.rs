use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::StartOutcome;
use super::task::TurnTask;
use super::{CoordinatorCommand, ParticipantContext, TurnFinish, TurnSignal};
use crate::billing::{BillingState, FlushHandle, SyncError, UsageMeter};
use crate::store::{DocumentStore, LanguageTag, Participant, SessionChange, SessionDocument};
use crate::telemetry::events::record_turn_outcome;
use crate::turn::capture::SpeechCaptureAdapter;
use crate::turn::config::CoordinatorConfig;
use crate::turn::constants::{ABORT_GRACE, COORDINATOR_TARGET, MAX_LANGUAGE_CANDIDATES};
use crate::turn::lock::{LockError, LockToken, TurnLockManager};
use crate::turn::playback::PlaybackSequencer;
use crate::turn::types::{RejectReason, TurnEvent, TurnPhase};
use crate::turn::watchdog::InactivityWatchdog;

struct ActiveTurn {
    id: u64,
    token: LockToken,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started: Instant,
}

/// Last observed lock held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteLock {
    holder_id: String,
    epoch: u64,
    text: String,
    is_final: bool,
}

pub(super) struct CoordinatorWorker {
    config: CoordinatorConfig,
    participant: ParticipantContext,
    store: Arc<dyn DocumentStore>,
    lock_manager: TurnLockManager,
    capture: Arc<SpeechCaptureAdapter>,
    sequencer: Arc<PlaybackSequencer>,
    meter: UsageMeter,
    flusher: Option<FlushHandle>,
    watchdog: InactivityWatchdog,
    participants: Vec<Participant>,
    remote: Option<RemoteLock>,
    active: Option<ActiveTurn>,
    next_turn_id: u64,
    command_rx: mpsc::Receiver<CoordinatorCommand>,
    signal_tx: mpsc::UnboundedSender<TurnSignal>,
    signal_rx: mpsc::UnboundedReceiver<TurnSignal>,
    events_tx: broadcast::Sender<TurnEvent>,
    phase_tx: watch::Sender<TurnPhase>,
    billing_tx: watch::Sender<BillingState>,
    changes: broadcast::Receiver<SessionChange>,
}

impl CoordinatorWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: CoordinatorConfig,
        participant: ParticipantContext,
        store: Arc<dyn DocumentStore>,
        lock_manager: TurnLockManager,
        capture: Arc<SpeechCaptureAdapter>,
        sequencer: Arc<PlaybackSequencer>,
        meter: UsageMeter,
        flusher: Option<FlushHandle>,
        document: SessionDocument,
        command_rx: mpsc::Receiver<CoordinatorCommand>,
        signal_tx: mpsc::UnboundedSender<TurnSignal>,
        signal_rx: mpsc::UnboundedReceiver<TurnSignal>,
        events_tx: broadcast::Sender<TurnEvent>,
        phase_tx: watch::Sender<TurnPhase>,
        billing_tx: watch::Sender<BillingState>,
        changes: broadcast::Receiver<SessionChange>,
    ) -> Self {
        let remote = document
            .turn_lock
            .as_ref()
            .filter(|lock| lock.holder_id != participant.participant_id)
            .map(|lock| RemoteLock {
                holder_id: lock.holder_id.clone(),
                epoch: lock.epoch,
                text: lock.utterance_text.clone(),
                is_final: lock.utterance_final,
            });

        Self {
            config,
            participant,
            store,
            lock_manager,
            capture,
            sequencer,
            meter,
            flusher,
            watchdog: InactivityWatchdog::new(),
            participants: document.participants,
            remote,
            active: None,
            next_turn_id: 0,
            command_rx,
            signal_tx,
            signal_rx,
            events_tx,
            phase_tx,
            billing_tx,
            changes,
        }
    }

    pub(super) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        let mut changes_open = true;
        self.sync_watchdog();

        info!(
            target: COORDINATOR_TARGET,
            session_id = %self.participant.session_id,
            participant_id = %self.participant.participant_id,
            phase = self.phase().as_str(),
            "turn coordinator started"
        );

        loop {
            tokio::select! {
                biased;

                maybe_command = self.command_rx.recv() => {
                    match maybe_command {
                        Some(CoordinatorCommand::Shutdown(reply)) => {
                            let flushed = self.teardown().await;
                            let _ = reply.send(flushed);
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            if let Err(err) = self.teardown().await {
                                warn!(target: COORDINATOR_TARGET, %err, "final flush failed after handle dropped");
                            }
                            break;
                        }
                    }
                }

                Some(signal) = self.signal_rx.recv() => {
                    self.handle_signal(signal).await;
                }

                change = self.changes.recv(), if changes_open => {
                    match change {
                        Ok(SessionChange::Updated(document)) => self.observe_document(document),
                        Ok(SessionChange::Removed { .. }) => {
                            self.session_removed().await;
                            break;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(target: COORDINATOR_TARGET, skipped, "session change feed lagged, refreshing");
                            self.refresh_document().await;
                        }
                        Err(RecvError::Closed) => changes_open = false,
                    }
                }
            }
        }

        info!(
            target: COORDINATOR_TARGET,
            session_id = %self.participant.session_id,
            participant_id = %self.participant.participant_id,
            "turn coordinator stopped"
        );
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::StartTurn(reply) => {
                let outcome = self.start_turn().await;
                let _ = reply.send(outcome);
            }
            CoordinatorCommand::Abort(reply) => {
                let aborted = self.abort_turn().await;
                if aborted {
                    self.emit(TurnEvent::Aborted);
                    if self.phase() != TurnPhase::Disabled {
                        self.set_phase(TurnPhase::Idle { timed_out: false });
                    }
                }
                let _ = reply.send(aborted);
            }
            CoordinatorCommand::TopUp { tokens, reply } => {
                self.top_up(tokens);
                let _ = reply.send(self.meter.state());
            }
            CoordinatorCommand::Shutdown(reply) => {
                let _ = reply.send(self.teardown().await);
            }
        }
    }

    async fn handle_signal(&mut self, signal: TurnSignal) {
        match signal {
            TurnSignal::InactivityTimeout { generation } => self.on_inactivity(generation).await,
            TurnSignal::Phase { turn_id, phase } if self.is_current(turn_id) => {
                self.set_phase(phase);
            }
            TurnSignal::Event { turn_id, event } if self.is_current(turn_id) => {
                self.emit(event);
            }
            TurnSignal::Finished { turn_id, finish } if self.is_current(turn_id) => {
                self.finish_turn(finish).await;
            }
            TurnSignal::Phase { turn_id, .. }
            | TurnSignal::Event { turn_id, .. }
            | TurnSignal::Finished { turn_id, .. } => {
                // 已中止轮次的迟到信号不再引起状态变化。
                debug!(target: COORDINATOR_TARGET, turn_id, "ignoring signal from stale turn");
            }
        }
    }

    async fn start_turn(&mut self) -> StartOutcome {
        if self.phase() == TurnPhase::Disabled || self.meter.has_outstanding() {
            self.set_phase(TurnPhase::Disabled);
            return self.reject(RejectReason::InsufficientBalance);
        }
        if self.active.is_some() {
            return self.reject(RejectReason::TurnInProgress);
        }

        let acquired = self
            .lock_manager
            .acquire(&self.participant.session_id, &self.participant.participant_id)
            .await;

        match acquired {
            Ok(token) => {
                let epoch = token.epoch;
                self.begin_turn(token);
                StartOutcome::Started { epoch }
            }
            Err(LockError::Busy { holder_id }) => {
                self.watchdog.kick();
                self.emit(TurnEvent::Busy {
                    holder_id: holder_id.clone(),
                });
                StartOutcome::Busy { holder_id }
            }
            Err(LockError::NotParticipant { .. }) => self.reject(RejectReason::NotParticipant),
            Err(LockError::SessionNotFound(_)) => self.reject(RejectReason::SessionNotFound),
            Err(LockError::Store(err)) => {
                warn!(
                    target: COORDINATOR_TARGET,
                    session_id = %self.participant.session_id,
                    %err,
                    "turn lock unavailable"
                );
                self.reject(RejectReason::Unavailable(err.to_string()))
            }
        }
    }

    fn reject(&self, reason: RejectReason) -> StartOutcome {
        self.emit(TurnEvent::Rejected {
            reason: reason.clone(),
        });
        StartOutcome::Rejected(reason)
    }

    fn begin_turn(&mut self, token: LockToken) {
        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        let cancel = CancellationToken::new();
        let started = Instant::now();

        self.set_phase(TurnPhase::Listening);

        let task = TurnTask {
            turn_id,
            session_id: self.participant.session_id.clone(),
            participant_id: self.participant.participant_id.clone(),
            token: token.clone(),
            candidates: self.language_candidates(),
            started,
            recognition_timeout: self.config.delivery.recognition_timeout(),
            renew_interval: self.config.lock.renew_interval(),
            renew_now: Notify::new(),
            cancel: cancel.clone(),
            capture: Arc::clone(&self.capture),
            sequencer: Arc::clone(&self.sequencer),
            lock_manager: self.lock_manager.clone(),
            store: Arc::clone(&self.store),
            signals: self.signal_tx.clone(),
        };

        self.active = Some(ActiveTurn {
            id: turn_id,
            token,
            cancel,
            task: tokio::spawn(task.run()),
            started,
        });
    }

    async fn finish_turn(&mut self, finish: TurnFinish) {
        let Some(active) = self.active.take() else {
            return;
        };
        let session_id = self.participant.session_id.clone();
        let participant_id = self.participant.participant_id.clone();

        match finish {
            TurnFinish::Delivered { report, active_ms } => {
                let charge = self.meter.record_active_interval(active_ms);
                self.publish_billing();
                self.release(&active.token).await;

                record_turn_outcome(
                    &session_id,
                    &participant_id,
                    if report.is_clean() { "delivered" } else { "partial" },
                    active.started.elapsed(),
                    report.delivered.len(),
                    report.failed.len(),
                );
                self.emit(TurnEvent::TurnCompleted {
                    report,
                    active_ms,
                    charge,
                });

                if charge.insufficient_funds {
                    self.emit(TurnEvent::InsufficientBalance {
                        required: charge.required,
                        balance: self.meter.state().local_balance,
                    });
                    self.set_phase(TurnPhase::Disabled);
                } else {
                    self.set_phase(TurnPhase::Idle { timed_out: false });
                }
            }
            TurnFinish::Ended(reason) => {
                self.release(&active.token).await;
                record_turn_outcome(
                    &session_id,
                    &participant_id,
                    "no_speech",
                    active.started.elapsed(),
                    0,
                    0,
                );
                self.emit(TurnEvent::RecognitionEnded { reason });
                self.set_phase(TurnPhase::Idle { timed_out: false });
            }
            TurnFinish::Canceled => {
                self.release(&active.token).await;
                self.emit(TurnEvent::Aborted);
                self.set_phase(TurnPhase::Idle { timed_out: false });
            }
        }
    }

    /// Stops the running turn and releases its lock. Usage of an aborted turn is not billed.
    async fn abort_turn(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            self.capture.abort().await;
            return false;
        };

        active.cancel.cancel();
        self.capture.abort().await;

        let mut task = active.task;
        if timeout(ABORT_GRACE, &mut task).await.is_err() {
            warn!(target: COORDINATOR_TARGET, turn_id = active.id, "turn task did not stop in time");
            task.abort();
        }

        self.release(&active.token).await;
        record_turn_outcome(
            &self.participant.session_id,
            &self.participant.participant_id,
            "aborted",
            active.started.elapsed(),
            0,
            0,
        );
        true
    }

    async fn release(&self, token: &LockToken) {
        if let Err(err) = self.lock_manager.release(token).await {
            warn!(
                target: COORDINATOR_TARGET,
                session_id = %token.session_id,
                %err,
                "failed to release turn lock, it will be reclaimed once stale"
            );
        }
    }

    async fn on_inactivity(&mut self, generation: u64) {
        if !self.watchdog.is_current(generation) {
            // 超时信号排队期间又有活动，重新计时。
            debug!(target: COORDINATOR_TARGET, generation, "stale inactivity timeout ignored");
            self.sync_watchdog();
            return;
        }
        if self.active.is_some() || self.phase() != (TurnPhase::Idle { timed_out: false }) {
            debug!(target: COORDINATOR_TARGET, "inactivity timeout outside idle phase ignored");
            return;
        }

        self.capture.abort().await;
        match self
            .lock_manager
            .force_release(&self.participant.session_id, &self.participant.participant_id)
            .await
        {
            Ok(released) => {
                if released {
                    info!(
                        target: COORDINATOR_TARGET,
                        session_id = %self.participant.session_id,
                        "released leftover turn lock after inactivity"
                    );
                }
            }
            Err(err) => warn!(
                target: COORDINATOR_TARGET,
                session_id = %self.participant.session_id,
                %err,
                "failed to force-release turn lock after inactivity"
            ),
        }

        info!(
            target: COORDINATOR_TARGET,
            session_id = %self.participant.session_id,
            participant_id = %self.participant.participant_id,
            timeout_ms = self.config.watchdog.inactivity_timeout_ms,
            "session idle timeout"
        );
        self.emit(TurnEvent::TimedOut);
        self.set_phase(TurnPhase::Idle { timed_out: true });
    }

    fn top_up(&mut self, tokens: i64) {
        if tokens <= 0 {
            warn!(target: COORDINATOR_TARGET, tokens, "ignoring non-positive top-up");
            return;
        }

        self.meter.credit(tokens);
        let settled = self.meter.settle_outstanding();
        self.publish_billing();
        self.emit(TurnEvent::ToppedUp {
            tokens,
            balance: self.meter.state().local_balance,
        });

        if settled.insufficient_funds {
            self.emit(TurnEvent::InsufficientBalance {
                required: settled.required,
                balance: self.meter.state().local_balance,
            });
            self.set_phase(TurnPhase::Disabled);
        } else if self.phase() == TurnPhase::Disabled {
            self.set_phase(TurnPhase::Idle { timed_out: false });
        }
    }

    fn observe_document(&mut self, document: SessionDocument) {
        if document.participants != self.participants {
            self.participants = document.participants;
            self.sync_watchdog();
        }

        let remote = document
            .turn_lock
            .filter(|lock| lock.holder_id != self.participant.participant_id)
            .map(|lock| RemoteLock {
                holder_id: lock.holder_id,
                epoch: lock.epoch,
                text: lock.utterance_text,
                is_final: lock.utterance_final,
            });

        if remote == self.remote {
            return;
        }

        // 他人开始发言、更新文本或释放锁都视为会话活动。
        self.watchdog.kick();
        if let Some(lock) = &remote {
            if !lock.text.is_empty() {
                self.emit(TurnEvent::RemoteUtterance {
                    holder_id: lock.holder_id.clone(),
                    text: lock.text.clone(),
                    is_final: lock.is_final,
                });
            }
        }
        self.remote = remote;
    }

    async fn refresh_document(&mut self) {
        match self.store.read(&self.participant.session_id).await {
            Ok(Some(document)) => self.observe_document(document),
            Ok(None) => debug!(target: COORDINATOR_TARGET, "session vanished during refresh"),
            Err(err) => warn!(target: COORDINATOR_TARGET, %err, "failed to refresh session document"),
        }
    }

    async fn session_removed(&mut self) {
        info!(
            target: COORDINATOR_TARGET,
            session_id = %self.participant.session_id,
            "session ended, stopping coordinator"
        );
        if let Err(err) = self.teardown().await {
            warn!(target: COORDINATOR_TARGET, %err, "final flush failed after session end");
        }
        self.emit(TurnEvent::SessionEnded);
    }

    async fn teardown(&mut self) -> Result<usize, SyncError> {
        if self.abort_turn().await {
            self.emit(TurnEvent::Aborted);
            if self.phase() != TurnPhase::Disabled {
                self.set_phase(TurnPhase::Idle { timed_out: false });
            }
        }
        self.watchdog.disarm();

        match self.flusher.take() {
            Some(flusher) => flusher.shutdown().await,
            None => Ok(0),
        }
    }

    fn language_candidates(&self) -> Vec<LanguageTag> {
        let mut candidates = vec![self.participant.language.clone()];
        for participant in &self.participants {
            if candidates.len() >= MAX_LANGUAGE_CANDIDATES {
                break;
            }
            if participant.language.is_empty()
                || candidates
                    .iter()
                    .any(|existing| existing.same_language(&participant.language))
            {
                continue;
            }
            candidates.push(participant.language.clone());
        }
        candidates
    }

    fn is_current(&self, turn_id: u64) -> bool {
        self.active
            .as_ref()
            .map(|active| active.id == turn_id)
            .unwrap_or(false)
    }

    fn phase(&self) -> TurnPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous == phase {
            return;
        }

        debug!(
            target: COORDINATOR_TARGET,
            session_id = %self.participant.session_id,
            from = previous.as_str(),
            to = phase.as_str(),
            "turn phase changed"
        );
        self.emit(TurnEvent::PhaseChanged { phase });
        self.sync_watchdog();
    }

    /// Armed only while idle (not timed out) with enough participants.
    fn sync_watchdog(&mut self) {
        let timeout = self.config.watchdog.timeout();
        let should_arm = self.phase() == (TurnPhase::Idle { timed_out: false })
            && self.participants.len() >= self.config.watchdog.min_participants
            && !timeout.is_zero();

        if should_arm {
            if !self.watchdog.is_armed() {
                let signals = self.signal_tx.clone();
                self.watchdog.arm(timeout, move |generation| {
                    let _ = signals.send(TurnSignal::InactivityTimeout { generation });
                });
            }
        } else {
            self.watchdog.disarm();
        }
    }

    fn publish_billing(&self) {
        self.billing_tx.send_replace(self.meter.state());
    }

    fn emit(&self, event: TurnEvent) {
        // 没有订阅者时丢弃事件。
        let _ = self.events_tx.send(event);
    }
}
