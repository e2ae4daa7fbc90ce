//! Limiting wrappers for log targets.
//!
//! This module provides the forwarding side of the crate:
//! - [`LimitingLayer`]: validated configuration, built with [`LimitingLayer::builder`].
//!   Implements `tower_layer::Layer`, so wrapping a target is `layer.layer(target)`.
//! - [`LimitingTarget`]: the wrapper itself. It owns one [`IntervalCounter`] and either
//!   gates writes or gates flushes.
//! - [`Setting`]: a limit or interval that is fixed or computed per item.
//! - [`AutoFlushPolicy`]: switches the wrapper from gating writes to gating flushes.
//!
//! # Gating writes
//!
//! Each item resolves its `(limit, interval)`. If the counter admits one more the item is
//! forwarded and counted, otherwise it is dropped and [`Delivery::Discarded`] is returned.
//!
//! # Gating flushes
//!
//! Every item is written. Items matching the flush condition additionally request a
//! downstream flush, which is subject to the limit. With `debounce_discarded_flushes`, a
//! discarded flush arms a trailing flush at the end of the current window so a burst is never
//! left unflushed. Explicit flushes (including the one issued on close) are "unconditional":
//! - a pending trailing flush is cancelled and the flush goes downstream right away;
//! - otherwise, with `flush_on_condition_only` or once the limit is reached, the flush is
//!   completed without reaching downstream;
//! - otherwise it is counted and forwarded.
//!
//! With `reset_after_unconditional_flush`, the counter is reset after an unconditional flush
//! that reached downstream. Cancelling the trailing flush always happens before the reset.
//!
//! [`IntervalCounter`]: crate::counter::IntervalCounter
//! [`Delivery::Discarded`]: crate::target::Delivery::Discarded

use chrono::TimeDelta;
use std::sync::Arc;

pub mod layer;
pub mod wrapper;

pub use layer::{LimitingLayer, LimitingLayerBuilder, Persistence};
pub use wrapper::LimitingTarget;

/// Predicate deciding whether an item should trigger a flush.
pub type Condition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A value that is either fixed at setup time or computed from each item.
pub enum Setting<T, V> {
    /// Validated at setup.
    Fixed(V),
    /// Resolved per item; a non-positive result rejects that item.
    PerItem(Arc<dyn Fn(&T) -> V + Send + Sync>),
}

impl<T, V: Copy> Setting<T, V> {
    pub fn per_item<F>(f: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        Setting::PerItem(Arc::new(f))
    }

    pub fn resolve(&self, item: &T) -> V {
        match self {
            Setting::Fixed(value) => *value,
            Setting::PerItem(f) => f(item),
        }
    }

    /// The value if fixed.
    pub fn fixed(&self) -> Option<V> {
        match self {
            Setting::Fixed(value) => Some(*value),
            Setting::PerItem(_) => None,
        }
    }
}

impl<T, V: Clone> Clone for Setting<T, V> {
    fn clone(&self) -> Self {
        match self {
            Setting::Fixed(value) => Setting::Fixed(value.clone()),
            Setting::PerItem(f) => Setting::PerItem(Arc::clone(f)),
        }
    }
}

impl<T, V: std::fmt::Debug> std::fmt::Debug for Setting<T, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Setting::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Setting::PerItem(_) => f.write_str("PerItem(<fn>)"),
        }
    }
}

/// Flush gating behavior.
pub struct AutoFlushPolicy<T> {
    pub(crate) condition: Condition<T>,
    pub(crate) flush_on_condition_only: bool,
    pub(crate) reset_after_unconditional_flush: bool,
    pub(crate) debounce_discarded_flushes: bool,
}

impl<T> AutoFlushPolicy<T> {
    /// Gate flushes triggered by items matching `condition`.
    ///
    /// Defaults: `flush_on_condition_only = true`, `reset_after_unconditional_flush = false`,
    /// `debounce_discarded_flushes = false`.
    pub fn new<F>(condition: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::with_condition(Arc::new(condition))
    }

    pub fn with_condition(condition: Condition<T>) -> Self {
        Self {
            condition,
            flush_on_condition_only: true,
            reset_after_unconditional_flush: false,
            debounce_discarded_flushes: false,
        }
    }

    /// When `false`, explicit flushes are forwarded (and counted) while under the limit.
    pub fn flush_on_condition_only(mut self, enabled: bool) -> Self {
        self.flush_on_condition_only = enabled;
        self
    }

    /// Reset the counter after an unconditional flush reached downstream.
    pub fn reset_after_unconditional_flush(mut self, enabled: bool) -> Self {
        self.reset_after_unconditional_flush = enabled;
        self
    }

    /// Arm a trailing flush at the end of the window when a flush is discarded.
    pub fn debounce_discarded_flushes(mut self, enabled: bool) -> Self {
        self.debounce_discarded_flushes = enabled;
        self
    }
}

impl<T> Clone for AutoFlushPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            condition: Arc::clone(&self.condition),
            flush_on_condition_only: self.flush_on_condition_only,
            reset_after_unconditional_flush: self.reset_after_unconditional_flush,
            debounce_discarded_flushes: self.debounce_discarded_flushes,
        }
    }
}

impl<T> std::fmt::Debug for AutoFlushPolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoFlushPolicy")
            .field("condition", &"<predicate>")
            .field("flush_on_condition_only", &self.flush_on_condition_only)
            .field("reset_after_unconditional_flush", &self.reset_after_unconditional_flush)
            .field("debounce_discarded_flushes", &self.debounce_discarded_flushes)
            .finish()
    }
}

/// What the counter gates.
pub(crate) enum Gate<T> {
    Writes,
    Flushes(AutoFlushPolicy<T>),
}

impl<T> std::fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gate::Writes => f.write_str("Writes"),
            Gate::Flushes(policy) => f.debug_tuple("Flushes").field(policy).finish(),
        }
    }
}

pub(crate) fn interval_ms(interval: TimeDelta) -> i64 {
    interval.num_milliseconds()
}
