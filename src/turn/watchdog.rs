//! 静默超时看门狗。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

type TimeoutCallback = Arc<dyn Fn(u64) + Send + Sync>;

struct Armed {
    timeout: Duration,
    on_timeout: TimeoutCallback,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct WatchdogInner {
    generation: AtomicU64,
    armed: Mutex<Option<Armed>>,
}

impl WatchdogInner {
    fn fire(&self, generation: u64) {
        let callback = {
            let mut armed = self.armed.lock();
            let is_current = armed
                .as_ref()
                .map(|current| current.generation == generation)
                .unwrap_or(false);
            if is_current {
                armed.take().map(|current| current.on_timeout)
            } else {
                None
            }
        };

        match callback {
            Some(on_timeout) => on_timeout(generation),
            None => debug!(target: "watchdog", generation, "stale watchdog timer ignored"),
        }
    }
}

/// Fires `on_timeout` once after a quiet period; `kick` restarts the countdown.
/// The callback receives the arming generation, see [`InactivityWatchdog::is_current`].
#[derive(Clone, Default)]
pub struct InactivityWatchdog {
    inner: Arc<WatchdogInner>,
}

impl InactivityWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the watchdog, replacing any previous arming. Must be called inside a tokio runtime.
    pub fn arm<F>(&self, timeout: Duration, on_timeout: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let mut armed = self.inner.armed.lock();
        if let Some(previous) = armed.take() {
            previous.timer.abort();
        }
        *armed = Some(self.schedule(timeout, Arc::new(on_timeout)));
    }

    /// Restarts the countdown. Returns `false` when the watchdog is not armed;
    /// the activity still outdates a timeout that already fired.
    pub fn kick(&self) -> bool {
        let mut armed = self.inner.armed.lock();
        match armed.take() {
            Some(previous) => {
                previous.timer.abort();
                *armed = Some(self.schedule(previous.timeout, previous.on_timeout));
                true
            }
            None => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Whether a timeout reported for `generation` still reflects the latest activity.
    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    pub fn disarm(&self) -> bool {
        let previous = self.inner.armed.lock().take();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        match previous {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.lock().is_some()
    }

    fn schedule(&self, timeout: Duration, on_timeout: TimeoutCallback) -> Armed {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire(generation);
            }
        });

        Armed {
            timeout,
            on_timeout,
            generation,
            timer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(u64) + Send + Sync + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook = fired.clone();
        (fired, move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_quiet_period() {
        let watchdog = InactivityWatchdog::new();
        let (fired, hook) = counter();
        watchdog.arm(Duration::from_secs(10), hook);
        assert!(watchdog.is_armed());

        sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());

        sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_within_window_postpones_timeout() {
        let watchdog = InactivityWatchdog::new();
        let (fired, hook) = counter();
        watchdog.arm(Duration::from_secs(10), hook);

        for _ in 0..5 {
            sleep(Duration::from_secs(8)).await;
            assert!(watchdog.kick());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_timeout() {
        let watchdog = InactivityWatchdog::new();
        let (fired, hook) = counter();
        watchdog.arm(Duration::from_secs(5), hook);
        assert!(watchdog.disarm());
        assert!(!watchdog.disarm());
        assert!(!watchdog.kick());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_after_firing_outdates_the_timeout() {
        let watchdog = InactivityWatchdog::new();
        let reported = Arc::new(Mutex::new(None));
        let slot = reported.clone();
        watchdog.arm(Duration::from_secs(5), move |generation| {
            *slot.lock() = Some(generation);
        });

        sleep(Duration::from_secs(6)).await;
        let generation = (*reported.lock()).expect("timeout fired");
        assert!(watchdog.is_current(generation));

        // 超时已触发但尚未处理时的活动。
        assert!(!watchdog.kick());
        assert!(!watchdog.is_current(generation));
    }
}
