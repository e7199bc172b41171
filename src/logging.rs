//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

/// Log file name inside `logging.dir`; the appender adds a date suffix.
const LOG_FILE_PREFIX: &str = "homebid.log";

/// Keeps the background file writer alive. Drop it only on exit, or
/// buffered lines are lost.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then `logging.level`.
pub fn build_filter(config: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(directive)
        .with_context(|| format!("Invalid log level directive '{}'", directive))
}

/// Install the global subscriber. Logs go to stderr, as JSON when
/// `logging.json` is set, and also to a daily file when `logging.dir` is set.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let filter = build_filter(config, verbose)?;

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}
