//! Structured logging setup.
//!
//! Two layers: a console layer for interactive runs and a non-ANSI file
//! layer at the configured `log_file_path` (default `logs/app.logs`). The
//! per-order import CLI output is NOT routed through here; workers capture
//! it into `logs/cli.<uuid>.logs` / `.errs` so concurrent imports do not
//! interleave.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with console and file output. Safe to call more than
/// once; only the first call installs the subscriber.
pub fn init(log_level: &str, log_file_path: &str) {
    let level = log_level.to_string();
    let file_path = log_file_path.to_string();

    LOGGER_INITIALIZED.get_or_init(|| {
        let path = Path::new(&file_path);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                // Missing log directory is a boot-time problem; surface it loudly.
                fs::create_dir_all(dir).expect("failed to create log directory");
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app.logs".to_string());
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new(level)),
            );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }

        // The non-blocking writer flushes on guard drop; keep it alive for
        // the whole process.
        std::mem::forget(guard);
    });
}
