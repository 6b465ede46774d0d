use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::models::LoggingConfig, core::model::Period};

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!("Structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!("Console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
            .wrap_err("A global tracing subscriber is already installed")?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("A global tracing subscriber is already installed")?;
    }

    tracing::info!(level, json = json_format, spans = include_spans, "Logging initialized");
    Ok(())
}

/// Initialize from the `[logging]` config section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&config.level, config.json, config.include_spans)
}

/// Span covering one push channel session
pub fn create_channel_span(endpoint: &str) -> tracing::Span {
    tracing::info_span!(
        "push_channel",
        channel.endpoint = endpoint,
        channel.attempt = tracing::field::Empty,
    )
}

/// Span covering one snapshot pull
pub fn create_fetch_span(period: Period, generation: u64) -> tracing::Span {
    tracing::info_span!(
        "snapshot_fetch",
        snapshot.period = period.as_str(),
        snapshot.generation = generation,
        duration_ms = tracing::field::Empty,
    )
}
