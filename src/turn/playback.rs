//! 顺序播放：逐个目标语种翻译、合成并播放完毕后再处理下一个。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::constants::PLAYBACK_TARGET;
use super::types::{DeliveryFailure, DeliveryProgress, DeliveryReport, DeliveryStage};
use crate::services::{AudioPlayer, TranslationClient};
use crate::store::LanguageTag;
use crate::telemetry::events::record_delivery_failure;

/// Runs `future` unless `cancel` fires first.
async fn unless_cancelled<T>(cancel: &CancellationToken, future: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = future => Some(value),
    }
}

pub struct PlaybackSequencer {
    client: TranslationClient,
    player: Arc<dyn AudioPlayer>,
    playback_timeout: Duration,
}

impl PlaybackSequencer {
    pub fn new(
        client: TranslationClient,
        player: Arc<dyn AudioPlayer>,
        playback_timeout: Duration,
    ) -> Self {
        Self {
            client,
            player,
            playback_timeout,
        }
    }

    /// Delivers `text` to each target in order; a failing target is reported and skipped.
    pub async fn deliver<F>(
        &self,
        session_id: &str,
        text: &str,
        source: &LanguageTag,
        targets: &[LanguageTag],
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> DeliveryReport
    where
        F: FnMut(DeliveryProgress) + Send,
    {
        let mut report = DeliveryReport::default();

        for target in targets {
            if cancel.is_cancelled() {
                report.canceled = true;
                break;
            }

            on_progress(DeliveryProgress::Translating {
                language: target.clone(),
            });
            let translated =
                match unless_cancelled(cancel, self.client.translate(text, source, target)).await {
                    None => {
                        report.canceled = true;
                        break;
                    }
                    Some(Ok(translated)) => translated,
                    Some(Err(err)) => {
                        let failure =
                            self.fail(session_id, target, DeliveryStage::Translate, err.to_string());
                        on_progress(DeliveryProgress::Failed(failure.clone()));
                        report.failed.push(failure);
                        continue;
                    }
                };

            let audio = match unless_cancelled(cancel, self.client.synthesize(&translated, target)).await
            {
                None => {
                    report.canceled = true;
                    break;
                }
                Some(Ok(audio)) => audio,
                Some(Err(err)) => {
                    let failure =
                        self.fail(session_id, target, DeliveryStage::Synthesize, err.to_string());
                    on_progress(DeliveryProgress::Failed(failure.clone()));
                    report.failed.push(failure);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                report.canceled = true;
                break;
            }

            on_progress(DeliveryProgress::Speaking {
                language: target.clone(),
            });
            debug!(
                target: PLAYBACK_TARGET,
                session_id,
                language = %target,
                bytes = audio.len(),
                "playing synthesized audio"
            );

            let playing = timeout(self.playback_timeout, self.player.play(audio));
            match unless_cancelled(cancel, playing).await {
                None => {
                    // 中止时丢弃正在播放的音频。
                    self.player.stop().await;
                    report.canceled = true;
                    break;
                }
                Some(Ok(Ok(()))) => {
                    on_progress(DeliveryProgress::Delivered {
                        language: target.clone(),
                    });
                    report.delivered.push(target.clone());
                }
                Some(Ok(Err(err))) => {
                    let failure = self.fail(session_id, target, DeliveryStage::Play, err.to_string());
                    on_progress(DeliveryProgress::Failed(failure.clone()));
                    report.failed.push(failure);
                }
                Some(Err(_)) => {
                    self.player.stop().await;
                    let failure = self.fail(
                        session_id,
                        target,
                        DeliveryStage::Play,
                        format!("playback exceeded {}ms", self.playback_timeout.as_millis()),
                    );
                    on_progress(DeliveryProgress::Failed(failure.clone()));
                    report.failed.push(failure);
                }
            }
        }

        info!(
            target: PLAYBACK_TARGET,
            session_id,
            targets = targets.len(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            canceled = report.canceled,
            "utterance delivery finished"
        );
        report
    }

    fn fail(
        &self,
        session_id: &str,
        target: &LanguageTag,
        stage: DeliveryStage,
        message: String,
    ) -> DeliveryFailure {
        warn!(
            target: PLAYBACK_TARGET,
            session_id,
            language = %target,
            stage = stage.as_str(),
            %message,
            "delivery to target failed, skipping"
        );
        record_delivery_failure(session_id, target.as_str(), stage.as_str(), &message);
        DeliveryFailure {
            language: target.clone(),
            stage,
            message,
        }
    }
}

