use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::mocks::{EchoSynthesizer, RecordingPlayer, TaggingTranslator};
use crate::services::{Translator, TranslationClient};
use crate::store::LanguageTag;
use crate::turn::playback::PlaybackSequencer;
use crate::turn::types::{DeliveryProgress, DeliveryStage};

fn sequencer(translator: Arc<dyn Translator>, player: Arc<RecordingPlayer>) -> PlaybackSequencer {
    let client = TranslationClient::new(
        translator,
        Arc::new(EchoSynthesizer),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    PlaybackSequencer::new(client, player, Duration::from_secs(30))
}

fn tags(values: &[&str]) -> Vec<LanguageTag> {
    values.iter().map(|value| LanguageTag::new(*value)).collect()
}

#[tokio::test(start_paused = true)]
async fn targets_are_played_one_after_another_in_order() {
    let player = RecordingPlayer::new(Duration::from_secs(2));
    let sequencer = sequencer(TaggingTranslator::new(), player.clone());
    let cancel = CancellationToken::new();
    let mut progress = Vec::new();

    let report = sequencer
        .deliver(
            "room",
            "hello",
            &LanguageTag::new("en-US"),
            &tags(&["ja-JP", "es", "ko"]),
            &cancel,
            |step| progress.push(step),
        )
        .await;

    assert!(report.is_clean());
    assert_eq!(report.delivered, tags(&["ja-JP", "es", "ko"]));
    assert_eq!(
        player.played(),
        vec!["[ja-JP] hello", "[es] hello", "[ko] hello"]
    );

    // 每个目标都先翻译、再播放、最后完成，不会交错。
    let order: Vec<&str> = progress
        .iter()
        .map(|step| match step {
            DeliveryProgress::Translating { .. } => "translating",
            DeliveryProgress::Speaking { .. } => "speaking",
            DeliveryProgress::Delivered { .. } => "delivered",
            DeliveryProgress::Failed(_) => "failed",
        })
        .collect();
    assert_eq!(
        order,
        vec![
            "translating", "speaking", "delivered",
            "translating", "speaking", "delivered",
            "translating", "speaking", "delivered",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_target_is_skipped_and_reported() {
    let player = RecordingPlayer::new(Duration::from_millis(500));
    let sequencer = sequencer(TaggingTranslator::failing_for(&["es"]), player.clone());
    let cancel = CancellationToken::new();

    let report = sequencer
        .deliver(
            "room",
            "good morning",
            &LanguageTag::new("en"),
            &tags(&["ja", "es", "ko"]),
            &cancel,
            |_| {},
        )
        .await;

    assert!(!report.canceled);
    assert_eq!(report.delivered, tags(&["ja", "ko"]));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].language, LanguageTag::new("es"));
    assert_eq!(report.failed[0].stage, DeliveryStage::Translate);
    assert_eq!(
        player.played(),
        vec!["[ja] good morning", "[ko] good morning"]
    );
}

#[tokio::test]
async fn no_targets_means_nothing_to_play() {
    let player = RecordingPlayer::new(Duration::ZERO);
    let sequencer = sequencer(TaggingTranslator::new(), player.clone());

    let report = sequencer
        .deliver(
            "room",
            "anyone?",
            &LanguageTag::new("en"),
            &[],
            &CancellationToken::new(),
            |_| panic!("no progress expected"),
        )
        .await;

    assert!(report.is_clean());
    assert!(report.delivered.is_empty());
    assert!(player.started().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_current_clip_and_skips_the_rest() {
    let player = RecordingPlayer::new(Duration::from_secs(10));
    let sequencer = Arc::new(sequencer(TaggingTranslator::new(), player.clone()));
    let cancel = CancellationToken::new();

    let delivery = {
        let sequencer = sequencer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sequencer
                .deliver(
                    "room",
                    "long speech",
                    &LanguageTag::new("en"),
                    &tags(&["ja", "es"]),
                    &cancel,
                    |_| {},
                )
                .await
        })
    };

    sleep(Duration::from_secs(3)).await;
    assert_eq!(player.started(), vec!["[ja] long speech"]);
    cancel.cancel();

    let report = delivery.await.expect("delivery task");
    assert!(report.canceled);
    assert!(report.delivered.is_empty());
    assert_eq!(player.stops(), 1);
    assert!(player.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn playback_timeout_is_a_play_failure() {
    let player = RecordingPlayer::new(Duration::from_secs(90));
    let client = TranslationClient::new(
        TaggingTranslator::new(),
        Arc::new(EchoSynthesizer),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    let sequencer = PlaybackSequencer::new(client, player.clone(), Duration::from_secs(30));

    let report = sequencer
        .deliver(
            "room",
            "stuck",
            &LanguageTag::new("en"),
            &tags(&["ja"]),
            &CancellationToken::new(),
            |_| {},
        )
        .await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].stage, DeliveryStage::Play);
    assert_eq!(player.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_translation_plays_nothing() {
    let player = RecordingPlayer::new(Duration::from_secs(1));
    let sequencer = Arc::new(sequencer(
        TaggingTranslator::slow(Duration::from_secs(4)),
        player.clone(),
    ));
    let cancel = CancellationToken::new();

    let delivery = {
        let sequencer = sequencer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sequencer
                .deliver(
                    "room",
                    "wait",
                    &LanguageTag::new("en"),
                    &tags(&["ja", "es"]),
                    &cancel,
                    |_| {},
                )
                .await
        })
    };

    sleep(Duration::from_secs(2)).await;
    cancel.cancel();

    let report = delivery.await.expect("delivery task");
    assert!(report.canceled);
    assert!(report.failed.is_empty());
    assert!(player.started().is_empty());
    assert_eq!(player.stops(), 0);
}
