//! Logging initialisation for vch-portlayer.
//!
//! When the `VCH_LOG` environment variable is set to `1`, structured
//! logs are also written to `<data>/logs/port-layer.log`. Otherwise only
//! stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::LOG_FILE;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` with the log directory, and hold the returned
/// `LogGuard` until exit.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let file_dir = match log_dir {
        Some(dir) if std::env::var("VCH_LOG").as_deref() == Ok("1") => Some(dir.to_path_buf()),
        _ => None,
    };

    let file_guard = if let Some(dir) = file_dir {
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}
