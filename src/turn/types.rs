use serde::Serialize;

use crate::billing::ChargeOutcome;
use crate::store::LanguageTag;

/// 单个参与者的轮次状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TurnPhase {
    Idle { timed_out: bool },
    Listening,
    Translating,
    Speaking,
    /// Balance cannot cover outstanding billing; only a top-up leaves this phase.
    Disabled,
}

impl Default for TurnPhase {
    fn default() -> Self {
        TurnPhase::Idle { timed_out: false }
    }
}

impl TurnPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, TurnPhase::Idle { .. })
    }

    /// A turn is in progress and holds (or is about to hold) the lock.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TurnPhase::Listening | TurnPhase::Translating | TurnPhase::Speaking
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Idle { timed_out: false } => "idle",
            TurnPhase::Idle { timed_out: true } => "idle_timed_out",
            TurnPhase::Listening => "listening",
            TurnPhase::Translating => "translating",
            TurnPhase::Speaking => "speaking",
            TurnPhase::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStage {
    Translate,
    Synthesize,
    Play,
}

impl DeliveryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStage::Translate => "translate",
            DeliveryStage::Synthesize => "synthesize",
            DeliveryStage::Play => "play",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub language: LanguageTag,
    pub stage: DeliveryStage,
    pub message: String,
}

/// Result of fanning one utterance out to every target language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<LanguageTag>,
    pub failed: Vec<DeliveryFailure>,
    pub canceled: bool,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.canceled
    }
}

/// Progress notification raised by the sequencer while it works through targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryProgress {
    Translating { language: LanguageTag },
    Speaking { language: LanguageTag },
    Delivered { language: LanguageTag },
    Failed(DeliveryFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientBalance,
    TurnInProgress,
    NotParticipant,
    SessionNotFound,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEndReason {
    NoMatch,
    Empty,
    Canceled(String),
    Failed(String),
    TimedOut,
}

/// 协调器向调用方（UI）广播的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    PhaseChanged {
        phase: TurnPhase,
    },
    /// Another participant holds the turn lock.
    Busy {
        holder_id: String,
    },
    Rejected {
        reason: RejectReason,
    },
    Partial {
        text: String,
        language: Option<LanguageTag>,
    },
    Recognized {
        text: String,
        language: LanguageTag,
        targets: Vec<LanguageTag>,
    },
    RecognitionEnded {
        reason: RecognitionEndReason,
    },
    TargetDelivered {
        language: LanguageTag,
    },
    DeliveryFailed(DeliveryFailure),
    TurnCompleted {
        report: DeliveryReport,
        active_ms: u64,
        charge: ChargeOutcome,
    },
    InsufficientBalance {
        required: i64,
        balance: i64,
    },
    ToppedUp {
        tokens: i64,
        balance: i64,
    },
    /// Text another participant is speaking, observed through the shared lock.
    RemoteUtterance {
        holder_id: String,
        text: String,
        is_final: bool,
    },
    Aborted,
    TimedOut,
    SessionEnded,
}
