//! Convenient re-exports for common logfence types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{AutoFlushOptions, LimitingOptions},
    counter::{CounterStore, InMemoryCounterStore, IntervalCounter, JsonFileStore},
    debounce::DebounceScheduler,
    error::{ConfigError, DebounceError, StoreError},
    limiting::{
        AutoFlushPolicy, Condition, LimitingLayer, LimitingLayerBuilder, LimitingTarget,
        Persistence, Setting,
    },
    sleeper::{Sleeper, TokioSleeper},
    target::{Delivery, FlushSignal, Target},
};
