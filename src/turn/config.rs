use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::constants::DEFAULT_LOCK_RENEW_INTERVAL;
use super::retry::RetryPolicy;
use crate::billing::{BillingConfig, SyncConfig};

pub const ENV_INACTIVITY_TIMEOUT_MS: &str = "TURNSTILE_INACTIVITY_TIMEOUT_MS";
pub const ENV_FREE_ALLOWANCE_MS: &str = "TURNSTILE_FREE_ALLOWANCE_MS";
pub const ENV_COST_PER_MINUTE: &str = "TURNSTILE_COST_PER_MINUTE";
pub const ENV_LOCK_STALE_AFTER_MS: &str = "TURNSTILE_LOCK_STALE_AFTER_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Locks older than this are reclaimed by the next acquirer. `None` disables reclaim.
    pub stale_after_ms: Option<u64>,
    pub max_transaction_attempts: u8,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: Some(120_000),
            max_transaction_attempts: 3,
        }
    }
}

impl LockConfig {
    /// How often a holder renews its lock while a turn runs.
    pub fn renew_interval(&self) -> Duration {
        match self.stale_after_ms {
            Some(stale_after_ms) => Duration::from_millis((stale_after_ms / 4).max(1)),
            None => DEFAULT_LOCK_RENEW_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub translate_timeout_ms: u64,
    pub synthesize_timeout_ms: u64,
    pub playback_timeout_ms: u64,
    /// Upper bound on a listening phase without a final result.
    pub recognition_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            translate_timeout_ms: 8_000,
            synthesize_timeout_ms: 10_000,
            playback_timeout_ms: 60_000,
            recognition_timeout_ms: 30_000,
        }
    }
}

impl DeliveryConfig {
    pub fn translate_timeout(&self) -> Duration {
        Duration::from_millis(self.translate_timeout_ms)
    }

    pub fn synthesize_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesize_timeout_ms)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_timeout_ms)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    /// Worst case for translating, synthesizing and playing one target.
    pub fn per_target_bound_ms(&self) -> u64 {
        self.translate_timeout_ms
            .saturating_add(self.synthesize_timeout_ms)
            .saturating_add(self.playback_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub inactivity_timeout_ms: u64,
    pub min_participants: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 60_000,
            min_participants: 2,
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// 单个参与者协调器的完整配置。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lock: LockConfig,
    pub billing: BillingConfig,
    pub sync: SyncConfig,
    pub delivery: DeliveryConfig,
    pub watchdog: WatchdogConfig,
    pub retry: RetryPolicy,
}

impl CoordinatorConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).context("failed to parse coordinator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.billing.cost_per_minute < 0 {
            bail!(
                "billing.cost_per_minute must not be negative, got {}",
                self.billing.cost_per_minute
            );
        }

        // 一次识别加一个目标的投递必须落在过期窗口内，否则持有者续约前就可能被回收。
        if let Some(stale_after_ms) = self.lock.stale_after_ms {
            let bound = self
                .delivery
                .recognition_timeout_ms
                .saturating_add(self.delivery.per_target_bound_ms());
            if stale_after_ms <= bound {
                bail!(
                    "lock.stale_after_ms ({stale_after_ms}) must exceed recognition plus one target delivery ({bound}ms)"
                );
            }
        }
        Ok(())
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override::<u64>(&lookup, ENV_INACTIVITY_TIMEOUT_MS) {
            self.watchdog.inactivity_timeout_ms = value;
        }
        if let Some(value) = parse_override::<u64>(&lookup, ENV_FREE_ALLOWANCE_MS) {
            self.billing.free_allowance_ms = value;
        }
        if let Some(value) = parse_override::<i64>(&lookup, ENV_COST_PER_MINUTE) {
            self.billing.cost_per_minute = value.max(0);
        }
        if let Some(raw) = lookup(ENV_LOCK_STALE_AFTER_MS) {
            let raw = raw.trim();
            if raw.is_empty() || raw == "0" || raw.eq_ignore_ascii_case("off") {
                self.lock.stale_after_ms = None;
            } else {
                match raw.parse::<u64>() {
                    Ok(value) => self.lock.stale_after_ms = Some(value),
                    Err(err) => warn!(
                        target: "config",
                        key = ENV_LOCK_STALE_AFTER_MS,
                        %err,
                        "ignoring invalid override"
                    ),
                }
            }
        }
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target: "config", key, %err, "ignoring invalid override");
            None
        }
    }
}
