use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::{LedgerEntry, LedgerHistory, PendingItem, UsageDelta};
use super::sync::{FlushHandle, PendingSyncQueue};
use crate::clock::Clock;
use crate::telemetry::events::{record_billing_charge, record_billing_insufficient};

/// One billable minute.
pub const BILLABLE_MINUTE_MS: u64 = 60_000;

/// 计费参数：免费额度之外按整分钟扣费。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub session_kind: String,
    pub free_allowance_ms: u64,
    pub cost_per_minute: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            session_kind: "multi_party_interpretation".to_string(),
            free_allowance_ms: 60_000,
            cost_per_minute: 1,
        }
    }
}

/// 单个参与者在某一会话类型下的计费状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingState {
    pub accumulated_active_ms: u64,
    pub last_billed_minute: u64,
    pub local_balance: i64,
}

impl BillingState {
    pub fn with_balance(local_balance: i64) -> Self {
        Self {
            local_balance,
            ..Self::default()
        }
    }

    /// `floor(max(0, accumulated - free) / 60000)`.
    pub fn billable_minutes(&self, config: &BillingConfig) -> u64 {
        self.accumulated_active_ms
            .saturating_sub(config.free_allowance_ms)
            / BILLABLE_MINUTE_MS
    }

    /// Minutes crossed but not yet charged.
    pub fn outstanding_minutes(&self, config: &BillingConfig) -> u64 {
        self.billable_minutes(config)
            .saturating_sub(self.last_billed_minute)
    }

    /// Rebuilds the state from durable ledger history.
    pub fn replay(history: &LedgerHistory) -> Self {
        Self {
            accumulated_active_ms: history.active_ms(),
            last_billed_minute: history.last_billed_minute(),
            local_balance: history.balance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChargeOutcome {
    pub charged: bool,
    pub tokens_deducted: i64,
    pub minutes_charged: u64,
    /// Balance could not cover `required`; nothing was deducted.
    pub insufficient_funds: bool,
    pub required: i64,
}

impl ChargeOutcome {
    fn uncharged() -> Self {
        Self::default()
    }
}

/// Meters active speaking time and bills it optimistically against the local balance.
pub struct UsageMeter {
    participant_id: String,
    config: BillingConfig,
    state: BillingState,
    queue: Arc<PendingSyncQueue>,
    flusher: Option<FlushHandle>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMeter")
            .field("participant_id", &self.participant_id)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl UsageMeter {
    pub fn new<S: Into<String>>(
        participant_id: S,
        config: BillingConfig,
        state: BillingState,
        queue: Arc<PendingSyncQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            config,
            state,
            queue,
            flusher: None,
            clock,
        }
    }

    pub fn with_flusher(mut self, flusher: FlushHandle) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn state(&self) -> BillingState {
        self.state
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Unsettled minutes block further turns until a top-up covers them.
    pub fn has_outstanding(&self) -> bool {
        self.state.outstanding_minutes(&self.config) > 0
    }

    pub fn record_active_interval(&mut self, duration_ms: u64) -> ChargeOutcome {
        self.state.accumulated_active_ms = self
            .state
            .accumulated_active_ms
            .saturating_add(duration_ms);

        if duration_ms > 0 {
            self.enqueue(PendingItem::Usage(UsageDelta::new(
                &self.participant_id,
                &self.config.session_kind,
                duration_ms,
                self.clock.now_ms(),
            )));
        }

        self.settle(duration_ms)
    }

    /// Charges minutes that were crossed while the balance was insufficient.
    pub fn settle_outstanding(&mut self) -> ChargeOutcome {
        self.settle(0)
    }

    /// Credits a top-up and records it in the ledger.
    pub fn credit(&mut self, tokens: i64) -> LedgerEntry {
        self.state.local_balance = self.state.local_balance.saturating_add(tokens);
        let entry = LedgerEntry::top_up(
            &self.participant_id,
            &self.config.session_kind,
            tokens,
            self.clock.now_ms(),
        );
        self.enqueue(PendingItem::Ledger(entry.clone()));
        info!(
            target: "billing",
            participant_id = %self.participant_id,
            tokens,
            balance = self.state.local_balance,
            "balance topped up"
        );
        entry
    }

    /// Records the opening balance for a participant without ledger history.
    pub fn record_opening_grant(&mut self) -> LedgerEntry {
        let entry = LedgerEntry::grant(
            &self.participant_id,
            &self.config.session_kind,
            self.state.local_balance,
            self.clock.now_ms(),
        );
        self.enqueue(PendingItem::Ledger(entry.clone()));
        entry
    }

    /// Replaces the cached state with the ledger-derived one and returns the balance drift
    /// (`ledger - cached`).
    pub fn reconcile(&mut self, history: &LedgerHistory) -> i64 {
        let durable = BillingState::replay(history);
        let drift = durable.local_balance - self.state.local_balance;
        if drift != 0 {
            warn!(
                target: "billing",
                participant_id = %self.participant_id,
                cached = self.state.local_balance,
                durable = durable.local_balance,
                "cached balance drifted from ledger, adopting ledger"
            );
        }
        self.state = durable;
        drift
    }

    fn settle(&mut self, duration_ms: u64) -> ChargeOutcome {
        let new_minute_index = self.state.billable_minutes(&self.config);
        if new_minute_index <= self.state.last_billed_minute {
            return ChargeOutcome::uncharged();
        }

        let minutes = new_minute_index - self.state.last_billed_minute;
        let cost = (minutes as i64).saturating_mul(self.config.cost_per_minute);

        if self.state.local_balance < cost {
            record_billing_insufficient(
                &self.participant_id,
                &self.config.session_kind,
                cost,
                self.state.local_balance,
            );
            return ChargeOutcome {
                insufficient_funds: true,
                required: cost,
                ..ChargeOutcome::uncharged()
            };
        }

        self.state.local_balance -= cost;
        self.state.last_billed_minute = new_minute_index;
        self.enqueue(PendingItem::Ledger(LedgerEntry::speech_usage(
            &self.participant_id,
            &self.config.session_kind,
            cost,
            minutes,
            duration_ms,
            new_minute_index,
            self.clock.now_ms(),
        )));

        record_billing_charge(
            &self.participant_id,
            &self.config.session_kind,
            minutes,
            cost,
            self.state.local_balance,
            new_minute_index,
        );

        ChargeOutcome {
            charged: cost > 0,
            tokens_deducted: cost,
            minutes_charged: minutes,
            insufficient_funds: false,
            required: cost,
        }
    }

    fn enqueue(&self, item: PendingItem) {
        self.queue.push(item);
        if let Some(flusher) = &self.flusher {
            flusher.request_flush();
        }
    }
}
