//! 有界重试：固定次数与间隔，耗尽后返回类型化结果而非错误。

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: E },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Ready { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Ready { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` is reached, sleeping
/// `policy.delay` between attempts. `op` receives the 1-based attempt number.
pub async fn retry_bounded<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Ready {
                    value,
                    attempts: attempt,
                }
            }
            Err(err) if attempt >= max_attempts => {
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last_error: err,
                }
            }
            Err(err) => {
                debug!(
                    target: "retry",
                    attempt,
                    max_attempts,
                    %err,
                    "attempt failed, retrying"
                );
                sleep(policy.delay()).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let outcome = retry_bounded(RetryPolicy::new(5, Duration::from_millis(100)), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("room not found yet ({attempt})"))
                } else {
                    Ok(attempt * 10)
                }
            }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Ready {
                value: 30,
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let outcome: RetryOutcome<(), String> =
            retry_bounded(RetryPolicy::new(2, Duration::from_millis(50)), |attempt| async move {
                Err(format!("failure {attempt}"))
            })
            .await;

        assert_eq!(outcome.attempts(), 2);
        assert_eq!(outcome.into_result(), Err("failure 2".to_string()));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let outcome: RetryOutcome<u8, String> =
            retry_bounded(RetryPolicy::new(0, Duration::ZERO), |_| async { Ok(1) }).await;
        assert_eq!(outcome.attempts(), 1);
    }
}
