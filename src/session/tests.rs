use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::*;
use crate::billing::{ActionType, LedgerEntry, PendingItem};
use crate::clock::ManualClock;
use crate::services::{
    ParticipantProfile, PlaybackError, RecognitionError, RecognitionStream, ServiceError,
};
use crate::store::{LanguageTag, MemoryStore};
use crate::turn::{LockConfig, TurnLockManager, TurnPhase};

struct SilentRecognizer;

#[async_trait]
impl SpeechRecognizer for SilentRecognizer {
    async fn start_continuous(
        &self,
        _candidates: &[LanguageTag],
    ) -> Result<RecognitionStream, RecognitionError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn stop(&self) {}
}

struct EchoTranslator;

#[async_trait]
impl Translator for EchoTranslator {
    async fn translate(
        &self,
        text: &str,
        _from: &LanguageTag,
        _to: &LanguageTag,
    ) -> Result<String, ServiceError> {
        Ok(text.to_string())
    }
}

struct EchoSynthesizer;

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, _language: &LanguageTag) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from(text.to_string()))
    }
}

struct NullPlayer;

#[async_trait]
impl AudioPlayer for NullPlayer {
    async fn play(&self, _audio: Bytes) -> Result<(), PlaybackError> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// Every participant speaks English and starts with the same balance hint.
struct FixedIdentity {
    balance: i64,
}

#[async_trait]
impl IdentityProvider for FixedIdentity {
    async fn profile(&self, participant_id: &str) -> Result<ParticipantProfile, ServiceError> {
        Ok(ParticipantProfile {
            participant_id: participant_id.to_string(),
            language: LanguageTag::new("en"),
            balance: self.balance,
        })
    }
}

fn manager(store: &MemoryStore, clock: Arc<ManualClock>, balance_hint: i64) -> SessionManager {
    SessionManager::new(
        CoordinatorConfig::default(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(FixedIdentity {
            balance: balance_hint,
        }),
        SpeechServices {
            recognizer: Arc::new(SilentRecognizer),
            translator: Arc::new(EchoTranslator),
            synthesizer: Arc::new(EchoSynthesizer),
            player: Arc::new(NullPlayer),
        },
        clock,
    )
}

#[tokio::test]
async fn open_join_and_leave_update_the_roster() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock.clone(), 10);

    let opened = sessions
        .open(vec![Participant::new("alice", "en-US")])
        .await
        .expect("open");
    let session_id = opened.session_id.clone();
    assert!(!session_id.is_empty());

    let joined = sessions
        .join(&session_id, Participant::new("bob", "ja-JP"))
        .await
        .expect("join");
    assert_eq!(joined.participants.len(), 2);

    // 重复加入只更新语言。
    let rejoined = sessions
        .join(&session_id, Participant::new("bob", "ja"))
        .await
        .expect("rejoin");
    assert_eq!(rejoined.participants.len(), 2);
    assert_eq!(
        rejoined.participant("bob").map(|p| p.language.clone()),
        Some(LanguageTag::new("ja"))
    );

    let locks = TurnLockManager::new(Arc::new(store.clone()), clock, LockConfig::default());
    locks.acquire(&session_id, "bob").await.expect("bob speaks");

    assert!(sessions.leave(&session_id, "bob").await.expect("leave"));
    assert!(!sessions.leave(&session_id, "bob").await.expect("leave twice"));
    let doc = store.read(&session_id).await.expect("read").expect("doc");
    assert!(doc.turn_lock.is_none());
    assert!(!doc.is_participant("bob"));

    assert!(sessions.end(&session_id).await.expect("end"));
    assert!(!sessions.leave(&session_id, "alice").await.expect("leave ended"));
}

#[tokio::test(start_paused = true)]
async fn join_waits_for_a_session_opened_elsewhere() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock.clone(), 10);

    let opener = {
        let other = manager(&store, clock, 10);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            other
                .open_with_id("late-room", vec![Participant::new("alice", "en")])
                .await
                .expect("open");
        })
    };

    let joined = sessions
        .join("late-room", Participant::new("bob", "ko"))
        .await
        .expect("join after retry");
    assert_eq!(joined.participants.len(), 2);
    opener.await.expect("opener");

    let err = sessions
        .join("never-opened", Participant::new("bob", "ko"))
        .await
        .expect_err("missing session");
    assert!(err.to_string().contains("never-opened"));
}

#[tokio::test]
async fn expire_idle_keeps_busy_and_recent_rooms() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock.clone(), 10);
    let pair = || {
        vec![
            Participant::new("alice", "en"),
            Participant::new("bob", "ja"),
        ]
    };

    sessions.open_with_id("quiet", pair()).await.expect("open");
    sessions.open_with_id("talking", pair()).await.expect("open");
    let locks = TurnLockManager::new(
        Arc::new(store.clone()),
        clock.clone(),
        LockConfig::default(),
    );
    locks.acquire("talking", "alice").await.expect("lock");

    clock.advance_ms(30 * 60 * 1_000);
    sessions.open_with_id("fresh", pair()).await.expect("open");

    let expired = sessions
        .expire_idle(Duration::from_secs(15 * 60))
        .await
        .expect("expire");
    assert_eq!(expired, vec!["quiet".to_string()]);

    let remaining: Vec<String> = store
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|doc| doc.session_id)
        .collect();
    assert_eq!(remaining, vec!["fresh".to_string(), "talking".to_string()]);
}

#[tokio::test]
async fn first_coordinator_records_opening_grant() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock, 7);
    sessions
        .open_with_id(
            "room",
            vec![Participant::new("alice", "en"), Participant::new("bob", "ja")],
        )
        .await
        .expect("open");

    let handle = sessions
        .start_coordinator("room", "alice")
        .await
        .expect("start coordinator");
    assert_eq!(handle.billing().local_balance, 7);
    assert_eq!(handle.phase(), TurnPhase::Idle { timed_out: false });
    handle.shutdown().await.expect("shutdown");

    let history = store
        .history("alice", &sessions.config().billing.session_kind)
        .await
        .expect("history");
    assert_eq!(history.entries.len(), 1);
    assert_eq!(history.entries[0].action_type, ActionType::Grant);
    assert_eq!(history.balance(), 7);
}

#[tokio::test]
async fn ledger_wins_over_identity_balance_hint() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock, 100);
    let kind = sessions.config().billing.session_kind.clone();
    sessions
        .open_with_id(
            "room",
            vec![Participant::new("alice", "en"), Participant::new("bob", "ja")],
        )
        .await
        .expect("open");

    let usage = LedgerEntry::speech_usage("alice", &kind, 3, 3, 240_000, 3, 2);
    store
        .append_batch(&[
            PendingItem::Ledger(LedgerEntry::grant("alice", &kind, 5, 1)),
            PendingItem::Ledger(usage),
        ])
        .await
        .expect("seed ledger");

    let handle = sessions
        .start_coordinator("room", "alice")
        .await
        .expect("start coordinator");
    let billing = handle.billing();
    assert_eq!(billing.local_balance, 2);
    assert_eq!(billing.last_billed_minute, 3);
    handle.shutdown().await.expect("shutdown");

    // 已有账本时不再写入开户额度。
    assert_eq!(store.ledger_len(), 2);
}

#[tokio::test]
async fn strangers_cannot_start_a_coordinator() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let sessions = manager(&store, clock, 5);
    sessions
        .open_with_id("room", vec![Participant::new("alice", "en")])
        .await
        .expect("open");

    let err = sessions
        .start_coordinator("room", "mallory")
        .await
        .err()
        .expect("not a participant");
    assert!(err.to_string().contains("mallory"));
}
