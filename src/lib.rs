#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # logfence
//!
//! Rate limiting and debounced flushing for log targets.
//!
//! ## Features
//!
//! - **Interval counters** with fixed-window reset semantics
//! - **Limiting targets** that drop items once `limit` per `interval` is reached
//! - **Flush limiting** that lets every item through but caps downstream flushes, with an
//!   optional trailing flush at the end of the window
//! - **Persistent counters** stored as small JSON documents, so limits survive restarts
//! - **Debounce scheduler** with last-request-wins semantics and race-safe cancellation
//!
//! ## Quick Start
//!
//! ```rust
//! use logfence::prelude::*;
//! use chrono::TimeDelta;
//!
//! let target = LimitingLayer::<String>::builder()
//!     .name("mail")
//!     .limit(5)
//!     .interval(TimeDelta::minutes(5))
//!     .wrap(logfence::target::CountingTarget::new())
//!     .unwrap();
//!
//! for i in 0..10 {
//!     target.write(format!("alert {i}"));
//! }
//! assert_eq!(target.inner().write_count(), 5);
//! target.close();
//! ```

pub mod clock;
pub mod config;
pub mod counter;
pub mod debounce;
pub mod error;
pub mod limiting;
pub mod prelude;
pub mod sleeper;
pub mod target;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoFlushOptions, LimitingOptions};
pub use counter::{CounterStore, InMemoryCounterStore, IntervalCounter, JsonFileStore, JsonFileStoreBuilder};
pub use debounce::DebounceScheduler;
pub use error::{ConfigError, DebounceError, StoreError};
pub use limiting::{AutoFlushPolicy, LimitingLayer, LimitingLayerBuilder, LimitingTarget, Persistence, Setting};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use target::{CountingTarget, Delivery, FlushSignal, Target};
