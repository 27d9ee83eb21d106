use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output format.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "debug", "cw_daemon=debug,warn").
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output format.
///
/// Safe to call multiple times -- subsequent calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Initialize the daemon lifecycle log: a daily-rolling file under `log_dir`
/// plus stderr.
///
/// File output goes through a non-blocking writer; keep the returned guard
/// alive for the life of the process or buffered lines are lost on exit.
/// If a global subscriber is already installed this only creates the writer.
pub fn init_daemon_logging(
    log_dir: &Path,
    service_name: &str,
    default_level: &str,
    json: bool,
) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let registry = tracing_subscriber::registry().with(env_filter(default_level));
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_ansi(false).with_writer(file_writer))
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(
            service = service_name,
            log_dir = %log_dir.display(),
            json,
            "daemon logging initialised"
        );
    }
    guard
}
