//! Clock abstractions used by interval counters and the debounce scheduler.
//!
//! Every time-dependent component takes an `Arc<dyn Clock>` at construction instead of
//! reading the system clock directly, so tests can drive time by hand with [`ManualClock`].

use crate::sleeper::Sleeper;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `Utc::now()`.
///
/// Unlike a monotonic clock this survives restarts, which matters because counter windows
/// are persisted and restored across process lifetimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying time. `ManualClock` is also a [`Sleeper`]: sleeps
/// complete when the clock is advanced past their deadline, never on real time, so timers
/// scheduled against it fire deterministically.
///
/// ```
/// use logfence::clock::{Clock, ManualClock};
/// use chrono::{TimeDelta, TimeZone, Utc};
///
/// let start = Utc.with_ymd_and_hms(2024, 10, 17, 12, 0, 0).unwrap();
/// let clock = ManualClock::new(start);
/// clock.advance(TimeDelta::minutes(6));
/// assert_eq!(clock.now(), start + TimeDelta::minutes(6));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<watch::Sender<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tx, _rx) = watch::channel(start);
        Self { current: Arc::new(tx) }
    }

    /// Create a clock frozen at the current wall-clock instant.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move time forward, waking any sleeper whose deadline has passed.
    pub fn advance(&self, delta: TimeDelta) {
        self.current.send_modify(|now| *now += delta);
    }

    /// Jump to a specific instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.current.send_modify(|now| *now = instant);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.borrow()
    }
}

impl Sleeper for ManualClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        // Deadline and subscription are taken eagerly so that an advance happening before
        // the future is first polled still counts.
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let deadline = self.now().checked_add_signed(delta);
        let mut rx = self.current.subscribe();
        Box::pin(async move {
            let Some(deadline) = deadline else {
                return std::future::pending().await;
            };
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        })
    }
}
