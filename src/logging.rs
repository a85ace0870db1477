//! Tracing setup: stderr for interactive use plus a non-blocking rolling file
//! appender in the configured log directory, trimmed down from the teacher's
//! `libs/common/src/logging.rs` (no gzip rotation, no custom bracketed
//! formatter — this crate's scope doesn't need either).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Must be kept alive for the lifetime of the process; dropping it stops the
/// background flush task for the file appender.
pub struct LoggingGuard(#[allow(dead_code)] WorkerGuard);

pub fn init(log_dir: &Path, log_level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dupont-tcc.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(true);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard(guard))
}
