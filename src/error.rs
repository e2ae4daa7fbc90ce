//! Error types for limiting targets, counter stores and the debounce scheduler
use std::path::PathBuf;
use thiserror::Error;

/// Setup-time misconfiguration. Raised by builders before any item flows.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A fixed limit or interval was zero or negative.
    #[error("{property} property must be > 0 (got {value})")]
    NonPositive {
        /// Name of the offending property (`limit` or `interval`).
        property: &'static str,
        /// Value provided by caller, rendered for display.
        value: String,
    },
    /// Flush gating needs fixed values because explicit flushes carry no item.
    #[error("{property} property must be fixed when flushes are limited")]
    PerItemNotSupported {
        /// Name of the offending property.
        property: &'static str,
    },
    /// An explicit state file was configured but is blank.
    #[error("state file must not be empty")]
    EmptyStateFile,
    /// Debounced flushes were requested outside of a tokio runtime.
    #[error("debouncing discarded flushes requires a tokio runtime")]
    NoRuntime,
    /// The host could not compile the flush condition.
    #[error("invalid condition `{expression}`: {reason}")]
    Condition {
        /// Expression as configured.
        expression: String,
        /// Reason reported by the host's compiler.
        reason: String,
    },
    /// Auto-flush options were configured without a condition.
    #[error("condition property must be set when flushes are limited")]
    MissingCondition,
}

/// Failure while loading, saving or deleting persisted counter state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem error.
    #[error("state file {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Content was present but not a valid counter document.
    #[error("state file {} is malformed: {}", .path.display(), .source)]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Check if the failure was caused by unparseable content
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Json { .. })
    }
}

/// Misuse of a [`DebounceScheduler`](crate::debounce::DebounceScheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DebounceError {
    /// The scheduler was disposed; no timer will ever fire again.
    #[error("debounce scheduler has been disposed")]
    Disposed,
}
