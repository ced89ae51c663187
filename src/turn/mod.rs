//! 轮次协调：发言锁、识别、顺序播放、计费与空闲看门狗。

pub mod capture;
pub mod config;
mod constants;
pub mod lock;
pub mod playback;
pub mod retry;
mod runtime;
pub mod types;
pub mod watchdog;

pub use config::{CoordinatorConfig, DeliveryConfig, LockConfig, WatchdogConfig};
pub use lock::{LockError, LockToken, TurnLockManager};
pub use playback::PlaybackSequencer;
pub use retry::{retry_bounded, RetryOutcome, RetryPolicy};
pub use runtime::{
    spawn_coordinator, CoordinatorDeps, CoordinatorError, ParticipantContext, StartOutcome,
    TurnCoordinatorHandle,
};
pub use types::{
    DeliveryFailure, DeliveryProgress, DeliveryReport, DeliveryStage, RecognitionEndReason,
    RejectReason, TurnEvent, TurnPhase,
};
pub use watchdog::InactivityWatchdog;

#[cfg(test)]
mod tests;
