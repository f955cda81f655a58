use std::backtrace::Backtrace;
use std::{env, panic};

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

use crate::config::{LogFormat, Logging};

/// Filter directives for the configured `level`.
///
/// The level applies to the cache crates, everything else only logs warnings and errors.
fn default_directives(level: LevelFilter) -> String {
    if level == LevelFilter::OFF {
        return "off".into();
    }
    let others = level.min(LevelFilter::WARN).to_string().to_lowercase();
    let level = level.to_string().to_lowercase();
    format!("{others},lazycache={level},lazycache_stress={level}")
}

fn filter(config: &Logging) -> Result<EnvFilter> {
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives).context("invalid RUST_LOG directives"),
        Err(_) => Ok(EnvFilter::new(default_directives(config.level))),
    }
}

/// Installs the global `tracing` subscriber for a process embedding the cache.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a subscriber has already been
/// installed.
pub fn init_logging(config: &Logging) -> Result<()> {
    let layer = tracing_subscriber::fmt::layer().with_timer(UtcTime::rfc_3339());

    let pretty = match config.format {
        LogFormat::Auto => console::user_attended(),
        LogFormat::Pretty => true,
        LogFormat::Simplified | LogFormat::Json => false,
    };
    let layer = if config.format == LogFormat::Json {
        layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter(config)?))
        .try_init()
        .context("failed to install logger")?;

    if config.enable_backtraces {
        log_panics();
    }
    Ok(())
}

/// Logs every panic with its backtrace instead of printing it to `stderr`.
fn log_panics() {
    panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!(%backtrace, "{info}");
    }));
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::dispatcher::has_been_set() {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
