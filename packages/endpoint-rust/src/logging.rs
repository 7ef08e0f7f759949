//! Tracing subscriber setup for hosts embedding an endpoint.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Builds the filter from `RUST_LOG`, falling back to `fallback`.
///
/// # Errors
///
/// Returns an error if `fallback` is not a valid filter directive.
pub fn env_filter(fallback: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback)
            .map_err(|err| anyhow::anyhow!("invalid log filter `{fallback}`: {err}")),
    }
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = env_filter(DEFAULT_FILTER)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init(),
    };
    result.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
