//! Append-only ledger records used to reconstruct billing state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of balance change captured by a [`LedgerEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SpeechUsage,
    TopUp,
    Grant,
}

impl ActionType {
    /// Returns the canonical string value persisted in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SpeechUsage => "speech_usage",
            ActionType::TopUp => "top_up",
            ActionType::Grant => "grant",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "speech_usage" => Some(ActionType::SpeechUsage),
            "top_up" => Some(ActionType::TopUp),
            "grant" => Some(ActionType::Grant),
            _ => None,
        }
    }
}

/// Immutable balance change. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub participant_id: String,
    pub session_kind: String,
    pub action_type: ActionType,
    pub token_delta: i64,
    pub description: String,
    pub duration_ms: Option<u64>,
    /// Minute index reached by this charge; only set for speech usage.
    pub billed_minute: Option<u64>,
    pub timestamp_ms: u64,
}

impl LedgerEntry {
    pub fn speech_usage(
        participant_id: impl Into<String>,
        session_kind: impl Into<String>,
        cost: i64,
        minutes: u64,
        duration_ms: u64,
        billed_minute: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            participant_id: participant_id.into(),
            session_kind: session_kind.into(),
            action_type: ActionType::SpeechUsage,
            token_delta: -cost,
            description: format!("interpreted speech: {minutes} billable minute(s)"),
            duration_ms: Some(duration_ms),
            billed_minute: Some(billed_minute),
            timestamp_ms,
        }
    }

    pub fn top_up(
        participant_id: impl Into<String>,
        session_kind: impl Into<String>,
        tokens: i64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            participant_id: participant_id.into(),
            session_kind: session_kind.into(),
            action_type: ActionType::TopUp,
            token_delta: tokens,
            description: format!("balance top-up: {tokens} token(s)"),
            duration_ms: None,
            billed_minute: None,
            timestamp_ms,
        }
    }

    pub fn grant(
        participant_id: impl Into<String>,
        session_kind: impl Into<String>,
        tokens: i64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            participant_id: participant_id.into(),
            session_kind: session_kind.into(),
            action_type: ActionType::Grant,
            token_delta: tokens,
            description: format!("opening balance: {tokens} token(s)"),
            duration_ms: None,
            billed_minute: None,
            timestamp_ms,
        }
    }
}

/// Active speaking time recorded for one interval, billed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    pub entry_id: Uuid,
    pub participant_id: String,
    pub session_kind: String,
    pub active_ms: u64,
    pub timestamp_ms: u64,
}

impl UsageDelta {
    pub fn new(
        participant_id: impl Into<String>,
        session_kind: impl Into<String>,
        active_ms: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            participant_id: participant_id.into(),
            session_kind: session_kind.into(),
            active_ms,
            timestamp_ms,
        }
    }
}

/// Item waiting in the pending-sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingItem {
    Ledger(LedgerEntry),
    Usage(UsageDelta),
}

impl PendingItem {
    pub fn entry_id(&self) -> Uuid {
        match self {
            PendingItem::Ledger(entry) => entry.entry_id,
            PendingItem::Usage(delta) => delta.entry_id,
        }
    }

    pub fn participant_id(&self) -> &str {
        match self {
            PendingItem::Ledger(entry) => &entry.participant_id,
            PendingItem::Usage(delta) => &delta.participant_id,
        }
    }
}

/// Durable ledger rows for one participant and session kind, in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerHistory {
    pub entries: Vec<LedgerEntry>,
    pub usage: Vec<UsageDelta>,
}

impl LedgerHistory {
    pub fn balance(&self) -> i64 {
        self.entries.iter().map(|entry| entry.token_delta).sum()
    }

    pub fn active_ms(&self) -> u64 {
        self.usage
            .iter()
            .fold(0_u64, |total, delta| total.saturating_add(delta.active_ms))
    }

    pub fn last_billed_minute(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.action_type == ActionType::SpeechUsage)
            .filter_map(|entry| entry.billed_minute)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.usage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_round_trips_through_db_value() {
        for action in [ActionType::SpeechUsage, ActionType::TopUp, ActionType::Grant] {
            assert_eq!(ActionType::from_db(action.as_str()), Some(action));
        }
        assert_eq!(ActionType::from_db("refund"), None);
    }

    #[test]
    fn history_aggregates_balance_usage_and_minutes() {
        let history = LedgerHistory {
            entries: vec![
                LedgerEntry::grant("p", "room", 10, 1),
                LedgerEntry::speech_usage("p", "room", 2, 1, 70_000, 1, 2),
                LedgerEntry::top_up("p", "room", 5, 3),
                LedgerEntry::speech_usage("p", "room", 4, 2, 120_000, 3, 4),
            ],
            usage: vec![
                UsageDelta::new("p", "room", 70_000, 2),
                UsageDelta::new("p", "room", 120_000, 4),
            ],
        };

        assert_eq!(history.balance(), 9);
        assert_eq!(history.active_ms(), 190_000);
        assert_eq!(history.last_billed_minute(), 3);
    }

    #[test]
    fn speech_usage_entry_is_a_debit() {
        let entry = LedgerEntry::speech_usage("p", "room", 6, 3, 180_000, 3, 9);
        assert_eq!(entry.token_delta, -6);
        assert_eq!(entry.action_type, ActionType::SpeechUsage);
        assert_eq!(entry.billed_minute, Some(3));
        assert!(entry.description.contains('3'));
    }
}
