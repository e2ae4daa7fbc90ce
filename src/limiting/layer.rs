//! Builder, validation and `tower_layer::Layer` for limiting targets.

use super::{interval_ms, AutoFlushPolicy, Gate, LimitingTarget, Setting};
use crate::clock::{Clock, SystemClock};
use crate::counter::store::{CounterStore, JsonFileStore};
use crate::error::ConfigError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::target::Target;
use chrono::TimeDelta;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tower_layer::Layer;

/// Where a limiting target keeps its counter across restarts.
#[derive(Debug, Clone, Default)]
pub enum Persistence {
    /// Counter lives only in memory.
    #[default]
    Disabled,
    /// JSON file under the temp directory, named after the target.
    DefaultFile,
    /// JSON file at an explicit location.
    File(PathBuf),
    /// Caller-supplied store.
    Store(Arc<dyn CounterStore>),
}

/// Validated configuration shared by every target produced from one layer.
pub(crate) struct LimitingConfig<T> {
    pub(crate) name: String,
    pub(crate) limit: Setting<T, i64>,
    pub(crate) interval: Setting<T, TimeDelta>,
    pub(crate) gate: Gate<T>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) store: Option<Arc<dyn CounterStore>>,
    pub(crate) delete_state_on_load: bool,
    pub(crate) runtime: Option<Handle>,
}

impl<T> std::fmt::Debug for LimitingConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitingConfig")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .field("gate", &self.gate)
            .field("store", &self.store)
            .field("delete_state_on_load", &self.delete_state_on_load)
            .finish()
    }
}

/// Validated limiting configuration; wraps targets via [`Layer`].
///
/// # Examples
/// ```
/// use logfence::limiting::LimitingLayer;
/// use logfence::target::{CountingTarget, Target};
/// use chrono::TimeDelta;
/// use tower_layer::Layer;
///
/// let layer = LimitingLayer::<String>::builder()
///     .limit(5)
///     .interval(TimeDelta::minutes(5))
///     .build()
///     .unwrap();
/// let target = layer.layer(CountingTarget::new());
/// for i in 0..10 {
///     target.write(format!("message {i}"));
/// }
/// assert_eq!(target.inner().write_count(), 5);
/// ```
pub struct LimitingLayer<T> {
    config: Arc<LimitingConfig<T>>,
}

impl<T> Clone for LimitingLayer<T> {
    fn clone(&self) -> Self {
        Self { config: Arc::clone(&self.config) }
    }
}

impl<T> std::fmt::Debug for LimitingLayer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitingLayer").field("config", &self.config).finish()
    }
}

impl<T> LimitingLayer<T> {
    pub fn builder() -> LimitingLayerBuilder<T> {
        LimitingLayerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl<T, W> Layer<W> for LimitingLayer<T>
where
    T: Send + 'static,
    W: Target<T> + 'static,
{
    type Service = LimitingTarget<T, W>;

    fn layer(&self, inner: W) -> Self::Service {
        LimitingTarget::open(Arc::clone(&self.config), inner)
    }
}

/// Builder for [`LimitingLayer`].
///
/// Limit and interval default to zero, so both must be set (or computed per item) before
/// [`build`](Self::build) succeeds.
pub struct LimitingLayerBuilder<T> {
    name: String,
    limit: Setting<T, i64>,
    interval: Setting<T, TimeDelta>,
    auto_flush: Option<AutoFlushPolicy<T>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    persistence: Persistence,
    delete_state_on_load: bool,
    runtime: Option<Handle>,
}

impl<T> Default for LimitingLayerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LimitingLayerBuilder<T> {
    pub fn new() -> Self {
        Self {
            name: "limiting".to_string(),
            limit: Setting::Fixed(0),
            interval: Setting::Fixed(TimeDelta::zero()),
            auto_flush: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            persistence: Persistence::Disabled,
            delete_state_on_load: false,
            runtime: None,
        }
    }

    /// Name used in diagnostics and for the default state file.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fixed maximum number of admitted items per interval. Must be > 0.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Setting::Fixed(limit);
        self
    }

    /// Compute the limit from each item.
    pub fn limit_per_item<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        self.limit = Setting::per_item(f);
        self
    }

    /// Fixed window length. Must be > 0.
    pub fn interval(mut self, interval: TimeDelta) -> Self {
        self.interval = Setting::Fixed(interval);
        self
    }

    /// Compute the window length from each item.
    pub fn interval_per_item<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> TimeDelta + Send + Sync + 'static,
    {
        self.interval = Setting::per_item(f);
        self
    }

    /// Gate flushes instead of writes.
    pub fn auto_flush(mut self, policy: AutoFlushPolicy<T>) -> Self {
        self.auto_flush = Some(policy);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override how the trailing-flush timer waits.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Use `clock` for both reading time and waiting on timers.
    pub fn clock_and_sleeper<C>(self, clock: C) -> Self
    where
        C: Clock + Sleeper + Clone + 'static,
    {
        self.clock(clock.clone()).sleeper(clock)
    }

    pub fn persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Shorthand for [`Persistence::File`].
    pub fn state_file(self, path: impl Into<PathBuf>) -> Self {
        self.persistence(Persistence::File(path.into()))
    }

    /// Shorthand for [`Persistence::Store`].
    pub fn store<S: CounterStore + 'static>(self, store: S) -> Self {
        self.persistence(Persistence::Store(Arc::new(store)))
    }

    /// Remove persisted state once it has been restored.
    pub fn delete_state_on_load(mut self, enabled: bool) -> Self {
        self.delete_state_on_load = enabled;
        self
    }

    /// Runtime for trailing-flush timers. Defaults to the runtime active during `build`.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// - [`ConfigError::NonPositive`] for a fixed `limit` or `interval` <= 0.
    /// - [`ConfigError::PerItemNotSupported`] when flushes are gated by per-item values.
    /// - [`ConfigError::NoRuntime`] when discarded flushes are debounced outside a runtime.
    /// - [`ConfigError::EmptyStateFile`] for a blank state file.
    pub fn build(self) -> Result<LimitingLayer<T>, ConfigError> {
        if let Some(limit) = self.limit.fixed() {
            if limit <= 0 {
                return Err(ConfigError::NonPositive { property: "limit", value: limit.to_string() });
            }
        }
        if let Some(interval) = self.interval.fixed() {
            if interval <= TimeDelta::zero() {
                return Err(ConfigError::NonPositive {
                    property: "interval",
                    value: format!("{}ms", interval_ms(interval)),
                });
            }
        }

        let gate = match self.auto_flush {
            Some(policy) => {
                if self.limit.fixed().is_none() {
                    return Err(ConfigError::PerItemNotSupported { property: "limit" });
                }
                if self.interval.fixed().is_none() {
                    return Err(ConfigError::PerItemNotSupported { property: "interval" });
                }
                Gate::Flushes(policy)
            }
            None => Gate::Writes,
        };

        let runtime = match &gate {
            Gate::Flushes(policy) if policy.debounce_discarded_flushes => {
                Some(self.runtime.or_else(|| Handle::try_current().ok()).ok_or(ConfigError::NoRuntime)?)
            }
            _ => None,
        };

        let store: Option<Arc<dyn CounterStore>> = match self.persistence {
            Persistence::Disabled => None,
            Persistence::DefaultFile => {
                Some(Arc::new(JsonFileStore::builder().use_name(&self.name).build()?))
            }
            Persistence::File(path) => Some(Arc::new(JsonFileStore::new(path)?)),
            Persistence::Store(store) => Some(store),
        };

        tracing::trace!(
            name = %self.name,
            limit = ?self.limit,
            interval = ?self.interval,
            gate = ?gate,
            "limiting layer initialized"
        );

        Ok(LimitingLayer {
            config: Arc::new(LimitingConfig {
                name: self.name,
                limit: self.limit,
                interval: self.interval,
                gate,
                clock: self.clock,
                sleeper: self.sleeper,
                store,
                delete_state_on_load: self.delete_state_on_load,
                runtime,
            }),
        })
    }

    /// Build and wrap `inner` in one step.
    pub fn wrap<W>(self, inner: W) -> Result<LimitingTarget<T, W>, ConfigError>
    where
        T: Send + 'static,
        W: Target<T> + 'static,
    {
        Ok(self.build()?.layer(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::InMemoryCounterStore;

    #[test]
    fn missing_limit_is_rejected() {
        let err = LimitingLayer::<u32>::builder().interval(TimeDelta::minutes(5)).build().unwrap_err();
        assert!(err.to_string().contains("limit property must be > 0"), "{err}");
    }

    #[test]
    fn missing_interval_is_rejected() {
        let err = LimitingLayer::<u32>::builder().limit(5).build().unwrap_err();
        assert!(err.to_string().contains("interval property must be > 0"), "{err}");
    }

    #[test]
    fn negative_values_are_rejected() {
        let err = LimitingLayer::<u32>::builder()
            .limit(-3)
            .interval(TimeDelta::minutes(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositive { property: "limit", .. }));

        let err = LimitingLayer::<u32>::builder()
            .limit(3)
            .interval(TimeDelta::seconds(-1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositive { property: "interval", .. }));
    }

    #[test]
    fn per_item_values_skip_static_validation() {
        let layer = LimitingLayer::<u32>::builder()
            .limit_per_item(|_| 0)
            .interval_per_item(|_| TimeDelta::zero())
            .build();
        assert!(layer.is_ok());
    }

    #[test]
    fn flush_gating_requires_fixed_values() {
        let err = LimitingLayer::<u32>::builder()
            .limit_per_item(|_| 1)
            .interval(TimeDelta::minutes(1))
            .auto_flush(AutoFlushPolicy::new(|_| true))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::PerItemNotSupported { property: "limit" }));
    }

    #[test]
    fn debounce_without_runtime_is_rejected() {
        let err = LimitingLayer::<u32>::builder()
            .limit(1)
            .interval(TimeDelta::minutes(1))
            .auto_flush(AutoFlushPolicy::new(|_| true).debounce_discarded_flushes(true))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoRuntime));
    }

    #[tokio::test]
    async fn debounce_captures_current_runtime() {
        let layer = LimitingLayer::<u32>::builder()
            .limit(1)
            .interval(TimeDelta::minutes(1))
            .auto_flush(AutoFlushPolicy::new(|_| true).debounce_discarded_flushes(true))
            .build()
            .unwrap();
        assert!(layer.config.runtime.is_some());
    }

    #[test]
    fn persistence_resolves_store() {
        let layer = LimitingLayer::<u32>::builder()
            .name("mail")
            .limit(1)
            .interval(TimeDelta::minutes(1))
            .persistence(Persistence::DefaultFile)
            .build()
            .unwrap();
        assert!(layer.config.store.is_some());
        assert_eq!(layer.name(), "mail");

        let layer = LimitingLayer::<u32>::builder()
            .limit(1)
            .interval(TimeDelta::minutes(1))
            .store(InMemoryCounterStore::new())
            .build()
            .unwrap();
        assert!(layer.config.store.is_some());

        let err = LimitingLayer::<u32>::builder()
            .limit(1)
            .interval(TimeDelta::minutes(1))
            .state_file("")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyStateFile));
    }
}
