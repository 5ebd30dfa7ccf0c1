//! # Structured Logging
//!
//! Process-wide `tracing` setup: env filter, console output in text or JSON,
//! and an optional daily rolling log file.

use std::sync::atomic::{AtomicBool, Ordering};

use ingest_types_rs::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::types::{Error, ErrorKind, Result};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the structured logging system.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// flushes the file writer when dropped and must be held for the lifetime of
/// the process. Calling this more than once is a no-op.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| {
            LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
            Error::new(
                ErrorKind::Configuration,
                format!("Invalid log level '{}': {}", settings.level, e),
            )
        })?;

    let console = if settings.json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", settings.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(console)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        Error::new(
            ErrorKind::Internal,
            format!("Failed to set global subscriber: {}", e),
        )
    })?;

    tracing::info!(
        service = %settings.service_name,
        level = %settings.level,
        json = settings.json,
        "Logging initialized"
    );

    Ok(guard)
}
