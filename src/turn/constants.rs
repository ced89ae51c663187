use std::time::Duration;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 16;
pub(crate) const LOCK_TARGET: &str = "turn_lock";
pub(crate) const COORDINATOR_TARGET: &str = "turn_coordinator";
pub(crate) const PLAYBACK_TARGET: &str = "playback";
pub(crate) const ABORT_GRACE: Duration = Duration::from_millis(500);
/// 关闭过期回收时，仍按此周期续约以便发现锁被清除。
pub(crate) const DEFAULT_LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(15);
/// Auto-detection accepts at most this many candidate languages.
pub(crate) const MAX_LANGUAGE_CANDIDATES: usize = 4;
