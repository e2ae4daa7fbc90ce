//! The limiting target: write gating, flush gating with a trailing flush, and counter
//! persistence across open and close.

use super::layer::LimitingConfig;
use super::{interval_ms, AutoFlushPolicy, Gate};
use crate::counter::IntervalCounter;
use crate::debounce::{DebounceAction, DebounceScheduler};
use crate::target::{Delivery, FlushSignal, Target};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Target wrapper that limits writes (or flushes) to `limit` per `interval`.
///
/// Created from a [`LimitingLayer`](super::LimitingLayer). On creation the counter is restored
/// from the configured store; on [`close`](Target::close) (or drop) it is saved back.
pub struct LimitingTarget<T, W: Target<T>> {
    shared: Arc<Shared<T, W>>,
}

struct Shared<T, W> {
    config: Arc<LimitingConfig<T>>,
    inner: W,
    counter: Mutex<IntervalCounter>,
    scheduler: Option<DebounceScheduler>,
    closed: AtomicBool,
}

/// What to do downstream after a write in flush-gating mode. Decided under the counter lock,
/// carried out after it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterWrite {
    Nothing,
    Flush,
    Debounce(DateTime<Utc>),
}

impl<T, W> LimitingTarget<T, W>
where
    T: Send + 'static,
    W: Target<T> + 'static,
{
    pub(crate) fn open(config: Arc<LimitingConfig<T>>, inner: W) -> Self {
        let counter = load_state(&config);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared<T, W>>| {
            let scheduler = config.runtime.clone().map(|runtime| {
                let weak = weak.clone();
                let action: DebounceAction = Arc::new(move |at| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_debounce_finished(at);
                    }
                });
                DebounceScheduler::new(
                    Arc::clone(&config.clock),
                    Arc::clone(&config.sleeper),
                    runtime,
                    action,
                )
            });
            Shared {
                config,
                inner,
                counter: Mutex::new(counter),
                scheduler,
                closed: AtomicBool::new(false),
            }
        });
        Self { shared }
    }
}

impl<T, W: Target<T>> LimitingTarget<T, W> {
    /// Snapshot of the current counter.
    pub fn counter(&self) -> IntervalCounter {
        *self.shared.counter.lock()
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Whether a trailing flush is armed.
    pub fn is_debounce_pending(&self) -> bool {
        self.shared.scheduler.as_ref().is_some_and(DebounceScheduler::is_pending)
    }

    /// The wrapped target.
    pub fn inner(&self) -> &W {
        &self.shared.inner
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

fn load_state<T>(config: &LimitingConfig<T>) -> IntervalCounter {
    let Some(store) = &config.store else {
        return IntervalCounter::new();
    };
    match store.load_state() {
        Ok(Some(counter)) => {
            tracing::debug!(
                name = %config.name,
                count = counter.count(),
                window_start = ?counter.window_start(),
                "loaded counter state"
            );
            if config.delete_state_on_load {
                if let Err(error) = store.delete_state() {
                    tracing::error!(name = %config.name, %error, "failed to delete counter state");
                }
            }
            counter
        }
        Ok(None) => {
            tracing::trace!(name = %config.name, "created new counter state");
            IntervalCounter::new()
        }
        Err(error) => {
            tracing::error!(name = %config.name, %error, "failed to load counter state");
            IntervalCounter::new()
        }
    }
}

impl<T, W: Target<T>> Shared<T, W> {
    fn write_limited(&self, item: T) -> Delivery {
        let limit = self.config.limit.resolve(&item);
        let interval = self.config.interval.resolve(&item);
        if limit <= 0 || interval <= TimeDelta::zero() {
            tracing::trace!(
                name = %self.config.name,
                limit,
                interval_ms = interval_ms(interval),
                "non-positive limit or interval; discarded item"
            );
            return Delivery::Discarded;
        }

        let now = self.config.clock.now();
        let admitted = {
            let mut counter = self.counter.lock();
            let admitted = counter.can_increment(interval, now, limit);
            if admitted {
                counter.increment_interval_aware(interval, now);
            }
            admitted
        };

        if admitted {
            self.inner.write(item)
        } else {
            tracing::trace!(
                name = %self.config.name,
                limit,
                interval_ms = interval_ms(interval),
                "limit reached; discarded item"
            );
            Delivery::Discarded
        }
    }

    fn write_with_flush_limit(&self, item: T, policy: &AutoFlushPolicy<T>) -> Delivery {
        let limit = self.config.limit.resolve(&item);
        let interval = self.config.interval.resolve(&item);

        let step = if (policy.condition)(&item) {
            let now = self.config.clock.now();
            let mut counter = self.counter.lock();
            if counter.can_increment(interval, now, limit) {
                counter.increment_interval_aware(interval, now);
                AfterWrite::Flush
            } else {
                counter.window_end(interval).map_or(AfterWrite::Nothing, AfterWrite::Debounce)
            }
        } else {
            AfterWrite::Nothing
        };

        let delivery = self.inner.write(item);

        match step {
            AfterWrite::Nothing => {}
            AfterWrite::Flush => {
                if let Some(scheduler) = &self.scheduler {
                    scheduler.cancel();
                }
                self.inner.flush(FlushSignal::detached());
            }
            AfterWrite::Debounce(at) => match &self.scheduler {
                Some(scheduler) => {
                    if let Err(error) = scheduler.schedule_at(at) {
                        tracing::trace!(name = %self.config.name, %error, "trailing flush not armed");
                    }
                }
                None => {
                    tracing::trace!(
                        name = %self.config.name,
                        limit,
                        interval_ms = interval_ms(interval),
                        "flush limit reached; discarded flush"
                    );
                }
            },
        }
        delivery
    }

    fn flush_unconditionally(&self, signal: FlushSignal, policy: &AutoFlushPolicy<T>) {
        let forced = self.scheduler.as_ref().is_some_and(DebounceScheduler::cancel);
        let forward = forced || {
            let (limit, interval) = self.fixed_settings();
            let now = self.config.clock.now();
            let mut counter = self.counter.lock();
            if policy.flush_on_condition_only || !counter.can_increment(interval, now, limit) {
                false
            } else {
                counter.increment_interval_aware(interval, now);
                true
            }
        };

        if !forward {
            signal.skip();
            return;
        }
        self.inner.flush(signal);
        if policy.reset_after_unconditional_flush {
            self.counter.lock().reset();
            tracing::trace!(name = %self.config.name, "counter reset after unconditional flush");
        }
    }

    fn fixed_settings(&self) -> (i64, TimeDelta) {
        (
            self.config.limit.fixed().unwrap_or(0),
            self.config.interval.fixed().unwrap_or_else(TimeDelta::zero),
        )
    }

    fn on_debounce_finished(&self, at: DateTime<Utc>) {
        let (_, interval) = self.fixed_settings();
        let current = self.counter.lock().window_end(interval);
        if current == Some(at) {
            tracing::trace!(name = %self.config.name, at = %at, "trailing flush");
            self.inner.flush(FlushSignal::detached());
        }
    }

    fn save_state(&self) {
        let Some(store) = &self.config.store else {
            return;
        };
        let counter = *self.counter.lock();
        match store.save_state(&counter) {
            Ok(()) => tracing::debug!(name = %self.config.name, count = counter.count(), "saved counter state"),
            Err(error) => tracing::error!(name = %self.config.name, %error, "failed to save counter state"),
        }
    }
}

impl<T, W: Target<T>> Target<T> for LimitingTarget<T, W> {
    fn write(&self, item: T) -> Delivery {
        let shared = &self.shared;
        match &shared.config.gate {
            Gate::Writes => shared.write_limited(item),
            Gate::Flushes(policy) => shared.write_with_flush_limit(item, policy),
        }
    }

    fn flush(&self, signal: FlushSignal) {
        let shared = &self.shared;
        match &shared.config.gate {
            Gate::Writes => shared.inner.flush(signal),
            Gate::Flushes(policy) => shared.flush_unconditionally(signal, policy),
        }
    }

    /// Flush, stop the trailing-flush timer, persist the counter and close the wrapped
    /// target. Only the first call has any effect.
    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush(FlushSignal::detached());
        if let Some(scheduler) = &self.shared.scheduler {
            scheduler.dispose();
        }
        self.shared.save_state();
        self.shared.inner.close();
    }
}

impl<T, W: Target<T>> Drop for LimitingTarget<T, W> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T, W> std::fmt::Debug for LimitingTarget<T, W>
where
    W: Target<T> + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitingTarget")
            .field("name", &self.shared.config.name)
            .field("counter", &self.shared.counter.try_lock().map(|c| *c))
            .field("scheduler", &self.shared.scheduler)
            .field("closed", &self.shared.closed)
            .field("inner", &self.shared.inner)
            .finish()
    }
}
