//! Error types for endpoint startup and handler invocation.

use std::fmt;

use missive_core::{AmbiguousClassification, ConventionError, MessageCategory};

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// Startup errors. The endpoint refuses to start when any is raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    AmbiguousClassification(#[from] AmbiguousClassification),
    #[error(
        "command `{full_name}` already has handler `{existing}`; cannot register `{attempted}`"
    )]
    DuplicateCommandHandler {
        full_name: String,
        existing: String,
        attempted: String,
    },
    #[error("message type `{full_name}` matches no convention and cannot have handlers")]
    UnclassifiedHandlerTarget { full_name: String },
    #[error("message type `{full_name}` is a {actual}, not a {expected}")]
    CategoryMismatch {
        full_name: String,
        expected: MessageCategory,
        actual: MessageCategory,
    },
    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },
    #[error("invalid classification pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl From<ConventionError> for ConfigurationError {
    fn from(err: ConventionError) -> Self {
        match err {
            ConventionError::EmptySetting { setting } => Self::InvalidSetting {
                setting,
                reason: "must not be empty".to_string(),
            },
            ConventionError::InvalidPattern { pattern, source } => Self::InvalidPattern {
                pattern,
                reason: source.to_string(),
            },
            ConventionError::UnroutableCategory { pattern } => Self::InvalidPattern {
                pattern,
                reason: "rule must yield command or event".to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Outcome of a failed handler invocation.
///
/// Consumed by the recoverability policy; never propagated out of the runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// May succeed on a later attempt.
    #[error("{reason}")]
    Transient { reason: String },
    /// Will never succeed; skips any remaining retry budget.
    #[error("{reason}")]
    Permanent { reason: String },
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl HandlerError {
    /// Failure worth retrying.
    #[must_use]
    pub fn transient(reason: impl fmt::Display) -> Self {
        Self::Transient {
            reason: reason.to_string(),
        }
    }

    /// Failure that skips every remaining retry.
    #[must_use]
    pub fn permanent(reason: impl fmt::Display) -> Self {
        Self::Permanent {
            reason: reason.to_string(),
        }
    }

    /// Whether the recoverability policy may retry after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    /// Short failure kind written to failure headers and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Any `anyhow` error a handler bubbles up with `?` is treated as transient.
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient {
            reason: format!("{err:#}"),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent {
            reason: format!("message body does not match handler type: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// EndpointError
// ---------------------------------------------------------------------------

/// Errors from starting or stopping an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("queue installation failed: {0:#}")]
    Installation(#[source] anyhow::Error),
    #[error("transport failure: {0:#}")]
    Transport(#[source] anyhow::Error),
}
