use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) const TARGET: &str = "telemetry::turns";
pub(crate) const EVENT_TURN_OUTCOME: &str = "turn_outcome";
pub(crate) const EVENT_LOCK_CONTENTION: &str = "turn_lock_contention";
pub(crate) const EVENT_DELIVERY_FAILURE: &str = "delivery_failure";
pub(crate) const EVENT_BILLING_CHARGE: &str = "billing_charge";
pub(crate) const EVENT_BILLING_INSUFFICIENT: &str = "billing_insufficient";
pub(crate) const EVENT_LEDGER_FLUSH: &str = "ledger_flush";

#[derive(Debug, Serialize)]
pub struct TurnOutcomeEvent<'a> {
    pub session_id: &'a str,
    pub participant_id: &'a str,
    pub outcome: &'static str,
    pub elapsed_ms: u64,
    pub delivered_targets: usize,
    pub failed_targets: usize,
}

#[derive(Debug, Serialize)]
pub struct LockContentionEvent<'a> {
    pub session_id: &'a str,
    pub participant_id: &'a str,
    pub holder_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct DeliveryFailureEvent<'a> {
    pub session_id: &'a str,
    pub target_language: &'a str,
    pub stage: &'static str,
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
pub struct BillingChargeEvent<'a> {
    pub participant_id: &'a str,
    pub session_kind: &'a str,
    pub minutes_charged: u64,
    pub tokens_deducted: i64,
    pub balance_after: i64,
    pub last_billed_minute: u64,
}

#[derive(Debug, Serialize)]
pub struct BillingInsufficientEvent<'a> {
    pub participant_id: &'a str,
    pub session_kind: &'a str,
    pub required: i64,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct LedgerFlushEvent<'a> {
    pub participant_id: &'a str,
    pub items: usize,
    pub result: &'static str,
    pub attempt: u32,
}

pub fn record_turn_outcome(
    session_id: &str,
    participant_id: &str,
    outcome: &'static str,
    elapsed: Duration,
    delivered_targets: usize,
    failed_targets: usize,
) {
    let event = TurnOutcomeEvent {
        session_id,
        participant_id,
        outcome,
        elapsed_ms: duration_to_ms(elapsed),
        delivered_targets,
        failed_targets,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_TURN_OUTCOME,
            session_id,
            participant_id,
            outcome,
            elapsed_ms = event.elapsed_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TURN_OUTCOME,
            %err,
            "failed to encode turn outcome event"
        ),
    }
}

pub fn record_lock_contention(session_id: &str, participant_id: &str, holder_id: &str) {
    let event = LockContentionEvent {
        session_id,
        participant_id,
        holder_id,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_LOCK_CONTENTION,
            session_id,
            participant_id,
            holder_id,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_LOCK_CONTENTION,
            %err,
            "failed to encode lock contention event"
        ),
    }
}

pub fn record_delivery_failure(
    session_id: &str,
    target_language: &str,
    stage: &'static str,
    message: &str,
) {
    let event = DeliveryFailureEvent {
        session_id,
        target_language,
        stage,
        message,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_DELIVERY_FAILURE,
            session_id,
            target_language,
            stage,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_DELIVERY_FAILURE,
            %err,
            "failed to encode delivery failure event"
        ),
    }
}

pub fn record_billing_charge(
    participant_id: &str,
    session_kind: &str,
    minutes_charged: u64,
    tokens_deducted: i64,
    balance_after: i64,
    last_billed_minute: u64,
) {
    let event = BillingChargeEvent {
        participant_id,
        session_kind,
        minutes_charged,
        tokens_deducted,
        balance_after,
        last_billed_minute,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_BILLING_CHARGE,
            participant_id,
            minutes_charged,
            tokens_deducted,
            balance_after,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_BILLING_CHARGE,
            %err,
            "failed to encode billing charge event"
        ),
    }
}

pub fn record_billing_insufficient(
    participant_id: &str,
    session_kind: &str,
    required: i64,
    balance: i64,
) {
    let event = BillingInsufficientEvent {
        participant_id,
        session_kind,
        required,
        balance,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_BILLING_INSUFFICIENT,
            participant_id,
            required,
            balance,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_BILLING_INSUFFICIENT,
            %err,
            "failed to encode billing insufficiency event"
        ),
    }
}

pub fn record_ledger_flush(participant_id: &str, items: usize, result: &'static str, attempt: u32) {
    let event = LedgerFlushEvent {
        participant_id,
        items,
        result,
        attempt,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_LEDGER_FLUSH,
            participant_id,
            items,
            result,
            attempt,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_LEDGER_FLUSH,
            %err,
            "failed to encode ledger flush event"
        ),
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
