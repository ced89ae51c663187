use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TurnFinish, TurnSignal};
use crate::store::{DocumentStore, LanguageTag};
use crate::telemetry::events::duration_to_ms;
use crate::turn::capture::{CaptureEvent, SpeechCaptureAdapter};
use crate::turn::constants::COORDINATOR_TARGET;
use crate::turn::lock::{LockToken, TurnLockManager};
use crate::turn::playback::PlaybackSequencer;
use crate::turn::types::{DeliveryProgress, RecognitionEndReason, TurnEvent, TurnPhase};

/// One listen → recognize → deliver cycle, run while the coordinator holds the lock.
pub(super) struct TurnTask {
    pub(super) turn_id: u64,
    pub(super) session_id: String,
    pub(super) participant_id: String,
    pub(super) token: LockToken,
    pub(super) candidates: Vec<LanguageTag>,
    pub(super) started: Instant,
    pub(super) recognition_timeout: Duration,
    pub(super) renew_interval: Duration,
    pub(super) renew_now: Notify,
    pub(super) cancel: CancellationToken,
    pub(super) capture: Arc<SpeechCaptureAdapter>,
    pub(super) sequencer: Arc<PlaybackSequencer>,
    pub(super) lock_manager: TurnLockManager,
    pub(super) store: Arc<dyn DocumentStore>,
    pub(super) signals: mpsc::UnboundedSender<TurnSignal>,
}

impl TurnTask {
    pub(super) async fn run(self) {
        let finish = self.execute().await;
        self.signal(TurnSignal::Finished {
            turn_id: self.turn_id,
            finish,
        });
    }

    async fn execute(&self) -> TurnFinish {
        let turn = self.listen_and_deliver();
        tokio::pin!(turn);

        tokio::select! {
            finish = &mut turn => finish,
            () = self.keep_lock_alive() => {
                // 锁已被他人接管，令牌已取消，等待播放停止后结束。
                let _ = turn.await;
                TurnFinish::Canceled
            }
        }
    }

    /// Renews the lock periodically and before each target. Returns only once the lock is lost.
    async fn keep_lock_alive(&self) {
        let mut ticks = interval_at(Instant::now() + self.renew_interval, self.renew_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = self.renew_now.notified() => {}
            }

            match self.lock_manager.renew(&self.token).await {
                Ok(true) => {}
                Ok(false) => {
                    self.lock_lost();
                    return;
                }
                Err(err) => warn!(
                    target: COORDINATOR_TARGET,
                    session_id = %self.session_id,
                    %err,
                    "failed to renew turn lock"
                ),
            }
        }
    }

    fn lock_lost(&self) {
        if !self.cancel.is_cancelled() {
            warn!(
                target: COORDINATOR_TARGET,
                session_id = %self.session_id,
                epoch = self.token.epoch,
                "turn lock taken over, stopping turn"
            );
            self.cancel.cancel();
        }
    }

    async fn listen_and_deliver(&self) -> TurnFinish {
        let mut stream = match self
            .capture
            .start(&self.candidates, self.cancel.child_token())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    target: COORDINATOR_TARGET,
                    session_id = %self.session_id,
                    %err,
                    "failed to start speech recognition"
                );
                return TurnFinish::Ended(RecognitionEndReason::Failed(err.to_string()));
            }
        };

        let deadline = Instant::now() + self.recognition_timeout;
        let (text, language) = loop {
            let event = match timeout_at(deadline, stream.next()).await {
                Ok(event) => event,
                Err(_) => {
                    self.capture.stop().await;
                    return TurnFinish::Ended(RecognitionEndReason::TimedOut);
                }
            };

            match event {
                CaptureEvent::Partial { text, language } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    self.publish_utterance(&text, false, language.as_ref()).await;
                    self.event(TurnEvent::Partial { text, language });
                }
                CaptureEvent::Final { text, language } => {
                    self.capture.stop().await;
                    break (text, language);
                }
                CaptureEvent::Ended(reason) => {
                    self.capture.stop().await;
                    return TurnFinish::Ended(reason);
                }
                CaptureEvent::Aborted => return TurnFinish::Canceled,
            }
        };

        if self.cancel.is_cancelled() {
            return TurnFinish::Canceled;
        }

        self.publish_utterance(&text, true, Some(&language)).await;
        let targets = self.targets(&language).await;
        self.event(TurnEvent::Recognized {
            text: text.clone(),
            language: language.clone(),
            targets: targets.clone(),
        });
        self.phase(TurnPhase::Translating);

        let report = self
            .sequencer
            .deliver(
                &self.session_id,
                &text,
                &language,
                &targets,
                &self.cancel,
                |progress| match progress {
                    DeliveryProgress::Translating { .. } => {
                        self.renew_now.notify_one();
                        self.phase(TurnPhase::Translating)
                    }
                    DeliveryProgress::Speaking { .. } => self.phase(TurnPhase::Speaking),
                    DeliveryProgress::Delivered { language } => {
                        self.event(TurnEvent::TargetDelivered { language })
                    }
                    DeliveryProgress::Failed(failure) => {
                        self.event(TurnEvent::DeliveryFailed(failure))
                    }
                },
            )
            .await;

        if report.canceled {
            return TurnFinish::Canceled;
        }

        TurnFinish::Delivered {
            report,
            active_ms: duration_to_ms(self.started.elapsed()),
        }
    }

    async fn publish_utterance(&self, text: &str, is_final: bool, language: Option<&LanguageTag>) {
        match self
            .lock_manager
            .update_utterance(&self.token, text, is_final, language)
            .await
        {
            Ok(true) => {}
            Ok(false) => self.lock_lost(),
            Err(err) => warn!(
                target: COORDINATOR_TARGET,
                session_id = %self.session_id,
                %err,
                "failed to publish utterance on turn lock"
            ),
        }
    }

    async fn targets(&self, source: &LanguageTag) -> Vec<LanguageTag> {
        match self.store.read(&self.session_id).await {
            Ok(Some(document)) => document.target_languages(&self.participant_id, source),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(
                    target: COORDINATOR_TARGET,
                    session_id = %self.session_id,
                    %err,
                    "failed to read participants, delivering to no targets"
                );
                Vec::new()
            }
        }
    }

    fn phase(&self, phase: TurnPhase) {
        self.signal(TurnSignal::Phase {
            turn_id: self.turn_id,
            phase,
        });
    }

    fn event(&self, event: TurnEvent) {
        self.signal(TurnSignal::Event {
            turn_id: self.turn_id,
            event,
        });
    }

    fn signal(&self, signal: TurnSignal) {
        if self.signals.send(signal).is_err() {
            debug!(target: COORDINATOR_TARGET, "coordinator gone, dropping turn signal");
        }
    }
}
