//! Logging setup
//!
//! Two sinks: a rolling log file and stdout. Stdout is always compact and
//! human-readable; the file carries targets and can switch to JSON for
//! structured queries. The default filter keeps the store's SQL driver and
//! the HTTP stack at warn so pipeline and agent logs stay legible;
//! `RUST_LOG` overrides everything.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Per-statement query logging from sqlx would drown out the trace-manager
    // lines the pipeline emits at the same level.
    let default_filter = format!("{},sqlx=warn,hyper=warn,tower=warn", config.log_level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if config.use_json {
        let stdout_layer = fmt::layer().compact().with_target(false).with_ansi(true);
        let file_layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(file_writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    } else {
        let stdout_layer = fmt::layer().compact().with_target(false).with_ansi(true);
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(file_writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    }

    guard
}
