use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::store::{LedgerStore, MemoryStore, StoreError};

fn config(free_allowance_ms: u64, cost_per_minute: i64) -> BillingConfig {
    BillingConfig {
        session_kind: "room".into(),
        free_allowance_ms,
        cost_per_minute,
    }
}

fn meter_with(config: BillingConfig, balance: i64) -> (UsageMeter, Arc<PendingSyncQueue>) {
    let queue = Arc::new(PendingSyncQueue::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
    let meter = UsageMeter::new(
        "alice",
        config,
        BillingState::with_balance(balance),
        queue.clone(),
        clock,
    );
    (meter, queue)
}

fn ledger_entries(items: &[PendingItem]) -> Vec<&LedgerEntry> {
    items
        .iter()
        .filter_map(|item| match item {
            PendingItem::Ledger(entry) => Some(entry),
            PendingItem::Usage(_) => None,
        })
        .collect()
}

#[test]
fn fractional_minutes_inside_free_allowance_never_bill() {
    let (mut meter, queue) = meter_with(config(60_000, 2), 5);

    let first = meter.record_active_interval(40_000);
    assert!(!first.charged);
    assert_eq!(meter.state().accumulated_active_ms, 40_000);

    let second = meter.record_active_interval(40_000);
    assert!(!second.charged);
    assert_eq!(second.tokens_deducted, 0);
    assert_eq!(meter.state().last_billed_minute, 0);
    assert_eq!(meter.state().local_balance, 5);

    let third = meter.record_active_interval(50_000);
    assert!(third.charged);
    assert_eq!(third.tokens_deducted, 2);
    assert_eq!(third.minutes_charged, 1);
    assert_eq!(meter.state().local_balance, 3);
    assert_eq!(meter.state().last_billed_minute, 1);
    assert_eq!(meter.state().accumulated_active_ms, 130_000);

    let pending = queue.snapshot();
    let charges = ledger_entries(&pending);
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].token_delta, -2);
    assert_eq!(charges[0].duration_ms, Some(50_000));
    assert_eq!(charges[0].billed_minute, Some(1));
    assert_eq!(pending.len(), 4, "three usage deltas plus one charge");
}

#[test]
fn total_deduction_is_independent_of_interval_split() {
    let total_ms = 7 * 60_000 + 12_345;
    let splits: Vec<Vec<u64>> = vec![
        vec![total_ms],
        vec![60_000, 60_000, 60_000, 60_000, 60_000, 60_000, 60_000, 12_345],
        vec![1, total_ms - 1],
        vec![59_999, 120_001, 160_000, 92_345],
        (0..total_ms / 5_000)
            .map(|_| 5_000)
            .chain(std::iter::once(total_ms % 5_000))
            .collect(),
    ];

    for split in splits {
        assert_eq!(split.iter().sum::<u64>(), total_ms);
        let (mut meter, _queue) = meter_with(config(90_000, 3), 1_000);
        let mut deducted = 0;
        let mut last_minute = 0;
        for interval in &split {
            let outcome = meter.record_active_interval(*interval);
            deducted += outcome.tokens_deducted;
            assert!(meter.state().last_billed_minute >= last_minute);
            last_minute = meter.state().last_billed_minute;
        }
        let expected_minutes = (total_ms - 90_000) / BILLABLE_MINUTE_MS;
        assert_eq!(deducted, expected_minutes as i64 * 3, "split {split:?}");
        assert_eq!(meter.state().local_balance, 1_000 - deducted);
    }
}

#[test]
fn insufficient_balance_leaves_state_untouched() {
    let (mut meter, queue) = meter_with(config(0, 2), 1);

    let outcome = meter.record_active_interval(60_000);
    assert!(outcome.insufficient_funds);
    assert!(!outcome.charged);
    assert_eq!(outcome.required, 2);
    assert_eq!(meter.state().local_balance, 1);
    assert_eq!(meter.state().last_billed_minute, 0);
    assert_eq!(meter.state().accumulated_active_ms, 60_000);
    assert!(meter.has_outstanding());
    assert!(ledger_entries(&queue.snapshot()).is_empty());

    let top_up = meter.credit(5);
    assert_eq!(top_up.action_type, ActionType::TopUp);
    assert_eq!(meter.state().local_balance, 6);

    let settled = meter.settle_outstanding();
    assert!(settled.charged);
    assert_eq!(settled.tokens_deducted, 2);
    assert_eq!(meter.state().local_balance, 4);
    assert_eq!(meter.state().last_billed_minute, 1);
    assert!(!meter.has_outstanding());
}

#[tokio::test]
async fn ledger_replay_recovers_optimistic_state() {
    let store = MemoryStore::new();
    let (mut meter, queue) = meter_with(config(60_000, 2), 10);
    meter.record_opening_grant();
    meter.record_active_interval(100_000);
    meter.record_active_interval(45_000);
    meter.credit(3);

    store
        .append_batch(&queue.take_all())
        .await
        .expect("append succeeds");

    let history = store.history("alice", "room").await.expect("history");
    let replayed = BillingState::replay(&history);
    assert_eq!(replayed, meter.state());

    let (mut stale, _queue) = meter_with(config(60_000, 2), 99);
    let drift = stale.reconcile(&history);
    assert_eq!(drift, meter.state().local_balance - 99);
    assert_eq!(stale.state(), meter.state());
}

#[test]
fn restore_front_keeps_failed_batch_ahead_of_new_items() {
    let queue = PendingSyncQueue::new();
    let first = PendingItem::Usage(UsageDelta::new("alice", "room", 1, 1));
    let second = PendingItem::Usage(UsageDelta::new("alice", "room", 2, 2));
    queue.push(first.clone());

    let batch = queue.take_all();
    assert!(queue.is_empty());
    queue.push(second.clone());
    queue.restore_front(batch);

    assert_eq!(queue.snapshot(), vec![first, second]);
}

struct CountingLedger {
    inner: MemoryStore,
    batches: AtomicUsize,
}

#[async_trait]
impl LedgerStore for CountingLedger {
    async fn append_batch(&self, batch: &[PendingItem]) -> Result<usize, StoreError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.inner.append_batch(batch).await
    }

    async fn history(
        &self,
        participant_id: &str,
        session_kind: &str,
    ) -> Result<LedgerHistory, StoreError> {
        self.inner.history(participant_id, session_kind).await
    }
}

fn usage(active_ms: u64) -> PendingItem {
    PendingItem::Usage(UsageDelta::new("alice", "room", active_ms, 1))
}

#[tokio::test(start_paused = true)]
async fn flusher_coalesces_requests_within_debounce_window() {
    let ledger = Arc::new(CountingLedger {
        inner: MemoryStore::new(),
        batches: AtomicUsize::new(0),
    });
    let queue = Arc::new(PendingSyncQueue::new());
    let (handle, task) = LedgerFlusher::spawn(
        "alice",
        queue.clone(),
        ledger.clone(),
        SyncConfig {
            debounce_ms: 2_000,
            ..SyncConfig::default()
        },
    );

    for active_ms in [100, 200, 300] {
        queue.push(usage(active_ms));
        handle.request_flush();
        sleep(Duration::from_millis(1_500)).await;
    }
    assert_eq!(ledger.batches.load(Ordering::SeqCst), 0);

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(ledger.batches.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.inner.ledger_len(), 3);
    assert!(queue.is_empty());

    assert_eq!(handle.shutdown().await.expect("shutdown flush"), 0);
    task.await.expect("flusher exits");
}

#[tokio::test(start_paused = true)]
async fn failed_flush_keeps_entries_and_retries() {
    let store = MemoryStore::new();
    store.fail_next_ledger_writes(2);
    let queue = Arc::new(PendingSyncQueue::new());
    let (handle, _task) = LedgerFlusher::spawn(
        "alice",
        queue.clone(),
        Arc::new(store.clone()),
        SyncConfig {
            debounce_ms: 500,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 4_000,
        },
    );

    queue.push(usage(10));
    queue.push(usage(20));
    let first = handle.flush_now().await;
    assert!(matches!(first, Err(SyncError::Store(_))));
    assert_eq!(queue.len(), 2);

    queue.push(usage(30));
    handle.request_flush();

    // 第二次失败后退避 2s，之后成功。
    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(store.ledger_len(), 0);
    assert_eq!(queue.len(), 3);

    sleep(Duration::from_millis(2_100)).await;
    assert_eq!(store.ledger_len(), 3);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn meter_requests_flush_on_enqueue() {
    let store = MemoryStore::new();
    let queue = Arc::new(PendingSyncQueue::new());
    let (handle, _task) = LedgerFlusher::spawn(
        "alice",
        queue.clone(),
        Arc::new(store.clone()),
        SyncConfig::default(),
    );
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let mut meter = UsageMeter::new(
        "alice",
        config(0, 1),
        BillingState::with_balance(3),
        queue.clone(),
        clock,
    )
    .with_flusher(handle.clone());

    meter.record_active_interval(61_000);
    assert_eq!(queue.len(), 2);

    assert_eq!(handle.flush_now().await.expect("flush"), 2);
    let history = store.history("alice", "room").await.expect("history");
    assert_eq!(history.balance(), -1, "charge without opening grant");
    assert_eq!(history.active_ms(), 61_000);
}

#[tokio::test]
async fn handle_reports_stopped_flusher() {
    let queue = Arc::new(PendingSyncQueue::new());
    let (handle, task) = LedgerFlusher::spawn(
        "alice",
        queue,
        Arc::new(MemoryStore::new()),
        SyncConfig::default(),
    );
    handle.shutdown().await.expect("shutdown");
    task.await.expect("flusher exits");

    assert_eq!(handle.flush_now().await, Err(SyncError::Stopped));
}
