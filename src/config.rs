//! Declarative configuration for limiting targets.
//!
//! Hosts that read their logging setup from a file deserialize [`LimitingOptions`] with
//! `serde_json` and hand it to [`LimitingLayerBuilder::from_options`]. Field names are
//! camelCase:
//!
//! ```json
//! {
//!   "name": "mail",
//!   "limit": 5,
//!   "intervalMs": 300000,
//!   "persist": true,
//!   "autoFlush": { "condition": "level >= Warn", "debounceDiscardedFlushes": true }
//! }
//! ```
//!
//! The condition is an opaque string; the host supplies the compiler that turns it into a
//! [`Condition`].

use crate::error::ConfigError;
use crate::limiting::{AutoFlushPolicy, Condition, LimitingLayerBuilder, Persistence};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration surface of a limiting target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitingOptions {
    /// Name used in diagnostics and for the default state file.
    #[serde(default)]
    pub name: Option<String>,
    /// Maximum admitted items (or flushes) per interval.
    #[serde(default)]
    pub limit: i64,
    /// Window length in milliseconds.
    #[serde(default)]
    pub interval_ms: i64,
    /// Persist the counter to the default state file.
    #[serde(default)]
    pub persist: bool,
    /// Explicit state file; implies persistence.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub delete_state_on_load: bool,
    /// Gate flushes instead of writes.
    #[serde(default)]
    pub auto_flush: Option<AutoFlushOptions>,
}

/// Flush gating options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoFlushOptions {
    pub condition: Option<String>,
    pub flush_on_condition_only: bool,
    pub reset_after_unconditional_flush: bool,
    pub debounce_discarded_flushes: bool,
}

impl Default for AutoFlushOptions {
    fn default() -> Self {
        Self {
            condition: None,
            flush_on_condition_only: true,
            reset_after_unconditional_flush: false,
            debounce_discarded_flushes: false,
        }
    }
}

impl LimitingOptions {
    /// Parse options from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn persistence(&self) -> Persistence {
        match &self.state_file {
            Some(path) => Persistence::File(path.clone()),
            None if self.persist => Persistence::DefaultFile,
            None => Persistence::Disabled,
        }
    }
}

impl<T> LimitingLayerBuilder<T> {
    /// Start a builder from declarative options.
    ///
    /// `compile` turns the auto-flush condition expression into a predicate; its error is
    /// reported as [`ConfigError::Condition`]. An `intervalMs` outside the representable
    /// range is rejected here; all other values are validated later, by `build`.
    pub fn from_options<F>(options: LimitingOptions, compile: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&str) -> Result<Condition<T>, String>,
    {
        let interval = TimeDelta::try_milliseconds(options.interval_ms).ok_or_else(|| {
            ConfigError::NonPositive { property: "interval", value: format!("{}ms", options.interval_ms) }
        })?;
        let persistence = options.persistence();
        let mut builder = LimitingLayerBuilder::new()
            .limit(options.limit)
            .interval(interval)
            .persistence(persistence)
            .delete_state_on_load(options.delete_state_on_load);
        if let Some(name) = options.name {
            builder = builder.name(name);
        }

        if let Some(auto_flush) = options.auto_flush {
            let expression = auto_flush
                .condition
                .filter(|c| !c.trim().is_empty())
                .ok_or(ConfigError::MissingCondition)?;
            let condition = compile(&expression)
                .map_err(|reason| ConfigError::Condition { expression: expression.clone(), reason })?;
            builder = builder.auto_flush(
                AutoFlushPolicy::with_condition(condition)
                    .flush_on_condition_only(auto_flush.flush_on_condition_only)
                    .reset_after_unconditional_flush(auto_flush.reset_after_unconditional_flush)
                    .debounce_discarded_flushes(auto_flush.debounce_discarded_flushes),
            );
        }
        Ok(builder)
    }
}
