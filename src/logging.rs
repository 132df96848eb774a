//! Logging configuration with journald support on Linux.
//!
//! Logs go to systemd-journald when it is reachable, otherwise to a daily
//! rolling file. `--verbose` sends them to stderr instead.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// journald on Linux, else a file under `log_dir`.
    Background,
    Stderr,
}

/// Initialize the logging system.
///
/// Log level is controlled via the `FACEGALLERY_LOG` environment variable
/// (`debug`, `info`, `warn`, `error`, or any `EnvFilter` directive). The
/// default is `info`, or `debug` for [`LogTarget::Stderr`].
pub fn init(target: LogTarget, log_dir: Option<PathBuf>) -> Result<()> {
    let default_level = match target {
        LogTarget::Stderr => "debug",
        LogTarget::Background => "info",
    };
    let env_filter = EnvFilter::try_from_env("FACEGALLERY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if target == LogTarget::Stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facegallery")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "facegallery.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread; init() runs once.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized with file backend");
    Ok(())
}
