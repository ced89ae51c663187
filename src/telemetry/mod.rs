//! 观测性初始化。

pub mod events;

use std::path::Path;

use anyhow::{Context, Result};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "turnstile.log";

/// Output format of the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelemetryFormat {
    #[default]
    Pretty,
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing() -> Result<()> {
    init_tracing_with_format(TelemetryFormat::Pretty)
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing_with_format(format: TelemetryFormat) -> Result<()> {
    let registry = Registry::default().with(env_filter());
    let result = match format {
        TelemetryFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        TelemetryFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    result.context("failed to set global tracing subscriber")
}

/// 同时输出到控制台与按天滚动的日志文件，返回的 guard 需要在进程生命周期内持有。
pub fn init_file_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let result = Registry::default()
        .with(env_filter())
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().json().with_writer(writer))
        .try_init();

    result.context("failed to set global tracing subscriber")?;
    Ok(guard)
}
