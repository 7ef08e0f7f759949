//! Endpoint configuration.
//!
//! A single [`EndpointConfig`] is built once at startup (from code, a JSON
//! file, or the host's CLI) and shared read-only behind an `Arc`.

use std::path::Path;

use missive_core::ConventionSettings;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// What to do with a well-formed message that no handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutedPolicy {
    /// Forward to the error queue with failure metadata.
    #[default]
    MoveToError,
    /// Acknowledge and drop, logging a warning.
    Acknowledge,
}

/// How event handlers of one message are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// One after another in registration order; stops at the first failure.
    #[default]
    Sequential,
    /// All at once; the delivery fails if any handler fails.
    Concurrent,
}

/// Exponential backoff between delayed retries.
///
/// The m-th delayed retry waits `min(base * 2^(m-1), max)`, randomized by
/// ±`jitter_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

/// Retry budgets and terminal destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverabilitySettings {
    #[serde(default = "defaults::max_immediate_retries")]
    pub max_immediate_retries: u32,
    #[serde(default = "defaults::enabled")]
    pub delayed_retry_enabled: bool,
    /// Only consulted when `delayed_retry_enabled` is set.
    #[serde(default = "defaults::max_delayed_retries")]
    pub max_delayed_retries: u32,
    #[serde(default)]
    pub delayed_backoff: BackoffSettings,
    /// Re-run the immediate retry budget after every delayed retry.
    #[serde(default)]
    pub reset_immediate_retries_per_delayed_round: bool,
    #[serde(default = "defaults::error_queue")]
    pub error_queue: String,
    #[serde(default = "defaults::audit_queue")]
    pub audit_queue: String,
    #[serde(default = "defaults::enabled")]
    pub audit_enabled: bool,
}

impl Default for RecoverabilitySettings {
    fn default() -> Self {
        Self {
            max_immediate_retries: defaults::max_immediate_retries(),
            delayed_retry_enabled: true,
            max_delayed_retries: defaults::max_delayed_retries(),
            delayed_backoff: BackoffSettings::default(),
            reset_immediate_retries_per_delayed_round: false,
            error_queue: defaults::error_queue(),
            audit_queue: defaults::audit_queue(),
            audit_enabled: true,
        }
    }
}

/// Top-level endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Endpoint name. Also the input queue name.
    pub endpoint_name: String,
    /// Opaque connection string handed to the transport unchanged.
    pub transport_connection: String,
    /// Create the input, error and audit queues at startup.
    pub enable_installers: bool,
    /// Maximum number of messages processed concurrently.
    pub worker_count: u32,
    /// Per-handler invocation timeout. A timeout counts as a handler failure.
    pub handler_timeout_ms: u64,
    /// How long `stop()` waits for in-flight deliveries.
    pub shutdown_grace_ms: u64,
    pub unrouted_policy: UnroutedPolicy,
    pub fan_out: FanOutMode,
    pub recoverability: RecoverabilitySettings,
    pub conventions: ConventionSettings,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "missive.endpoint".to_string(),
            transport_connection: String::new(),
            enable_installers: true,
            worker_count: 8,
            handler_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            unrouted_policy: UnroutedPolicy::default(),
            fan_out: FanOutMode::default(),
            recoverability: RecoverabilitySettings::default(),
            conventions: ConventionSettings::default(),
        }
    }
}

impl EndpointConfig {
    /// Default configuration for the named endpoint.
    #[must_use]
    pub fn named(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            ..Self::default()
        }
    }

    /// The queue this endpoint receives from.
    #[must_use]
    pub fn input_queue(&self) -> &str {
        &self.endpoint_name
    }

    /// Parses configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed input.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Ok(Self::from_json_str(&raw)?)
    }

    /// Checks settings that would make the endpoint unable to run.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSetting` naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let recoverability = &self.recoverability;
        let backoff = &recoverability.delayed_backoff;

        if self.endpoint_name.trim().is_empty() {
            return Err(invalid("endpoint_name", "must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.handler_timeout_ms == 0 {
            return Err(invalid("handler_timeout_ms", "must be greater than zero"));
        }
        if recoverability.error_queue.trim().is_empty() {
            return Err(invalid("recoverability.error_queue", "must not be empty"));
        }
        if recoverability.error_queue == self.endpoint_name {
            return Err(invalid(
                "recoverability.error_queue",
                "must differ from the input queue",
            ));
        }
        if recoverability.audit_enabled {
            if recoverability.audit_queue.trim().is_empty() {
                return Err(invalid("recoverability.audit_queue", "must not be empty"));
            }
            if recoverability.audit_queue == self.endpoint_name {
                return Err(invalid(
                    "recoverability.audit_queue",
                    "must differ from the input queue",
                ));
            }
        }
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(invalid(
                "recoverability.delayed_backoff.jitter_factor",
                "must be within 0.0..=1.0",
            ));
        }
        if backoff.base_delay_ms > backoff.max_delay_ms {
            return Err(invalid(
                "recoverability.delayed_backoff.base_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

fn invalid(setting: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        setting,
        reason: reason.to_string(),
    }
}

mod defaults {
    pub const fn max_immediate_retries() -> u32 {
        5
    }

    pub const fn max_delayed_retries() -> u32 {
        3
    }

    pub const fn enabled() -> bool {
        true
    }

    pub const fn base_delay_ms() -> u64 {
        10_000
    }

    pub const fn max_delay_ms() -> u64 {
        3_600_000 // 1 hour
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }

    pub fn error_queue() -> String {
        "error".to_string()
    }

    pub fn audit_queue() -> String {
        "audit".to_string()
    }
}
