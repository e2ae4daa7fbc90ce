//! Debounce scheduler: at most one pending "fire at T" timer, last requested instant wins.
//!
//! Semantics:
//! - `schedule_at(T)` with `T <= now` runs the action inline and schedules nothing.
//! - A request for the instant already pending is a no-op.
//! - Any other request replaces the pending timer (sliding window, not earliest-wins).
//! - `cancel()` drops the pending timer; `dispose()` additionally rejects further requests
//!   with [`DebounceError::Disposed`]. Dropping the scheduler disposes it.
//!
//! Invariants:
//! - Timer handle and de-duplication key are only touched under the state mutex, so two
//!   concurrent requests can never both install "the" active timer.
//! - A timer fires only if its generation is still current when it completes; a cancel
//!   that takes the lock first always wins.

use crate::clock::Clock;
use crate::error::DebounceError;
use crate::sleeper::Sleeper;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Upper bound on waiting for the scheduler lock while scheduling.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Callback invoked with the instant it was scheduled for.
pub type DebounceAction = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

#[derive(Debug)]
struct Pending {
    at: DateTime<Utc>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: Option<Pending>,
    // most recently requested instant; suppresses re-arming the identical timer
    last_requested: Option<DateTime<Utc>>,
    generation: u64,
    disposed: bool,
}

impl SchedulerState {
    fn clear(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.last_requested = None;
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    action: DebounceAction,
    runtime: Handle,
}

impl Inner {
    fn fire(&self, generation: u64, at: DateTime<Utc>) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.generation != generation {
                return;
            }
            state.pending = None;
            state.last_requested = None;
        }
        (self.action)(at);
    }
}

/// Coalesces "fire at T" requests into a single pending timer.
pub struct DebounceScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DebounceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.try_lock();
        f.debug_struct("DebounceScheduler")
            .field("pending_at", &state.as_ref().and_then(|s| s.pending.as_ref().map(|p| p.at)))
            .field("disposed", &state.as_ref().map(|s| s.disposed))
            .field("clock", &self.inner.clock)
            .field("sleeper", &self.inner.sleeper)
            .field("action", &"<action>")
            .finish()
    }
}

impl DebounceScheduler {
    /// Create a scheduler whose timers run on `runtime`.
    pub fn new(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        runtime: Handle,
        action: DebounceAction,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                clock,
                sleeper,
                action,
                runtime,
            }),
        }
    }

    /// Create a scheduler on the current tokio runtime. Returns `None` outside a runtime.
    pub fn on_current_runtime(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        action: DebounceAction,
    ) -> Option<Self> {
        Handle::try_current().ok().map(|runtime| Self::new(clock, sleeper, runtime, action))
    }

    /// Request the action to run at `at`.
    ///
    /// # Errors
    /// [`DebounceError::Disposed`] after [`dispose`](Self::dispose).
    pub fn schedule_at(&self, at: DateTime<Utc>) -> Result<(), DebounceError> {
        let Some(mut state) = self.inner.state.try_lock_for(LOCK_TIMEOUT) else {
            tracing::warn!(at = %at, "debounce scheduler busy; request skipped");
            return Ok(());
        };
        if state.disposed {
            return Err(DebounceError::Disposed);
        }

        let now = self.inner.clock.now();
        let delay = match (at - now).to_std() {
            Ok(delay) if !delay.is_zero() => delay,
            // due already; run inline without holding the lock. A timer still pending for
            // this instant (or an earlier one) must not fire a second time.
            _ => {
                if state.pending.is_some() {
                    state.clear();
                }
                drop(state);
                (self.inner.action)(at);
                return Ok(());
            }
        };

        if state.pending.is_some() && state.last_requested == Some(at) {
            return Ok(());
        }

        state.clear();
        let generation = state.generation;
        let sleep = self.inner.sleeper.sleep(delay);
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            sleep.await;
            inner.fire(generation, at);
        });
        state.pending = Some(Pending { at, task });
        state.last_requested = Some(at);
        tracing::trace!(at = %at, delay_ms = delay.as_millis() as u64, "debounce armed");
        Ok(())
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        self.inner.state.lock().clear()
    }

    /// Cancel and refuse any further scheduling. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.clear();
        state.disposed = true;
    }

    /// Whether a timer is currently pending.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Instant of the pending timer.
    pub fn pending_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().pending.as_ref().map(|p| p.at)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 17, 12, 0, 0).unwrap()
    }

    #[derive(Clone, Default)]
    struct Recorder {
        fired: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    impl Recorder {
        fn action(&self) -> DebounceAction {
            let fired = self.fired.clone();
            Arc::new(move |at| fired.lock().push(at))
        }

        fn fired(&self) -> Vec<DateTime<Utc>> {
            self.fired.lock().clone()
        }
    }

    fn scheduler(clock: &ManualClock, recorder: &Recorder) -> DebounceScheduler {
        DebounceScheduler::on_current_runtime(
            Arc::new(clock.clone()),
            Arc::new(clock.clone()),
            recorder.action(),
        )
        .expect("inside runtime")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(clock: &ManualClock, delta: TimeDelta) {
        settle().await;
        clock.advance(delta);
        settle().await;
    }

    #[tokio::test]
    async fn fires_once_at_requested_instant() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let at = t0() + TimeDelta::minutes(1);
        sut.schedule_at(at).unwrap();
        assert!(sut.is_pending());

        advance(&clock, TimeDelta::seconds(59)).await;
        assert!(recorder.fired().is_empty());

        advance(&clock, TimeDelta::seconds(1)).await;
        assert_eq!(recorder.fired(), vec![at]);
        assert!(!sut.is_pending());
    }

    #[tokio::test]
    async fn repeated_request_for_same_instant_fires_once() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let at = t0() + TimeDelta::minutes(3);
        sut.schedule_at(at).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        sut.schedule_at(at).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        sut.schedule_at(at).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        advance(&clock, TimeDelta::minutes(5)).await;

        assert_eq!(recorder.fired(), vec![at]);
    }

    #[tokio::test]
    async fn later_request_replaces_pending_one() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let t1 = t0() + TimeDelta::minutes(2);
        let t2 = t0() + TimeDelta::minutes(4);
        sut.schedule_at(t1).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        sut.schedule_at(t2).unwrap();
        assert_eq!(sut.pending_at(), Some(t2));

        advance(&clock, TimeDelta::minutes(2)).await;
        assert!(recorder.fired().is_empty(), "replaced timer must not fire");

        advance(&clock, TimeDelta::minutes(1)).await;
        assert_eq!(recorder.fired(), vec![t2]);
    }

    #[tokio::test]
    async fn sliding_requests_fire_once() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        for _ in 0..4 {
            sut.schedule_at(clock.now() + TimeDelta::minutes(2)).unwrap();
            advance(&clock, TimeDelta::minutes(1)).await;
        }
        advance(&clock, TimeDelta::minutes(10)).await;

        assert_eq!(recorder.fired().len(), 1);
    }

    #[tokio::test]
    async fn past_instant_runs_inline() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let at = t0() + TimeDelta::minutes(1);
        clock.advance(TimeDelta::minutes(2));
        sut.schedule_at(at).unwrap();

        assert_eq!(recorder.fired(), vec![at]);
        assert!(!sut.is_pending());

        sut.schedule_at(clock.now()).unwrap();
        assert_eq!(recorder.fired().len(), 2);
    }

    #[tokio::test]
    async fn due_request_replaces_pending_timer_for_same_instant() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let at = t0() + TimeDelta::minutes(1);
        sut.schedule_at(at).unwrap();
        settle().await;

        clock.set(at);
        sut.schedule_at(at).unwrap();
        assert_eq!(recorder.fired(), vec![at]);
        assert!(!sut.is_pending());

        advance(&clock, TimeDelta::minutes(2)).await;
        assert_eq!(recorder.fired(), vec![at]);
    }

    #[tokio::test]
    async fn busy_lock_skips_request_with_warning() {
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let inner = Arc::clone(&sut.inner);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _state = inner.state.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(LOCK_TIMEOUT * 3);
        });
        locked_rx.recv().unwrap();

        assert_eq!(sut.schedule_at(t0() + TimeDelta::minutes(1)), Ok(()));
        holder.join().unwrap();

        assert_eq!(sut.pending_at(), None);
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("debounce scheduler busy"), "{logs}");
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        sut.schedule_at(t0() + TimeDelta::minutes(3)).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        assert!(sut.cancel());
        assert!(!sut.cancel());
        advance(&clock, TimeDelta::minutes(3)).await;

        assert!(recorder.fired().is_empty());
    }

    #[tokio::test]
    async fn cancel_clears_deduplication_key() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        let at = t0() + TimeDelta::minutes(3);
        sut.schedule_at(at).unwrap();
        sut.cancel();
        sut.schedule_at(at).unwrap();
        assert_eq!(sut.pending_at(), Some(at));

        advance(&clock, TimeDelta::minutes(3)).await;
        assert_eq!(recorder.fired(), vec![at]);
    }

    #[tokio::test]
    async fn dispose_cancels_and_rejects_further_requests() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        sut.schedule_at(t0() + TimeDelta::minutes(2)).unwrap();
        advance(&clock, TimeDelta::minutes(1)).await;
        sut.dispose();
        advance(&clock, TimeDelta::minutes(3)).await;

        assert!(recorder.fired().is_empty());
        assert!(sut.is_disposed());
        assert_eq!(sut.schedule_at(clock.now()), Err(DebounceError::Disposed));
        assert_eq!(
            sut.schedule_at(clock.now() + TimeDelta::minutes(1)),
            Err(DebounceError::Disposed)
        );
        sut.dispose();
    }

    #[tokio::test]
    async fn drop_disposes_pending_timer() {
        let clock = ManualClock::new(t0());
        let recorder = Recorder::default();
        let sut = scheduler(&clock, &recorder);

        sut.schedule_at(t0() + TimeDelta::minutes(1)).unwrap();
        drop(sut);
        advance(&clock, TimeDelta::minutes(2)).await;

        assert!(recorder.fired().is_empty());
    }

    #[tokio::test]
    async fn sleeps_for_remaining_delay() {
        let clock = ManualClock::new(t0());
        let sleeper = TrackingSleeper::new();
        let recorder = Recorder::default();
        let sut = DebounceScheduler::on_current_runtime(
            Arc::new(clock.clone()),
            Arc::new(sleeper.clone()),
            recorder.action(),
        )
        .unwrap();

        sut.schedule_at(t0() + TimeDelta::seconds(90)).unwrap();
        settle().await;

        assert_eq!(sleeper.calls(), vec![Duration::from_secs(90)]);
        assert_eq!(recorder.fired(), vec![t0() + TimeDelta::seconds(90)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_leave_single_timer() {
        let clock = ManualClock::new(t0());
        let calls = Arc::new(AtomicUsize::new(0));
        let action: DebounceAction = {
            let calls = calls.clone();
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let sut = Arc::new(
            DebounceScheduler::on_current_runtime(Arc::new(clock.clone()), Arc::new(clock.clone()), action)
                .unwrap(),
        );

        let at = t0() + TimeDelta::minutes(5);
        let mut handles = Vec::new();
        for i in 0..16 {
            let sut = sut.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    // alternate between two instants to force replacement races
                    let target = if (i + j) % 2 == 0 { at } else { at - TimeDelta::seconds(1) };
                    sut.schedule_at(target).unwrap();
                }
                sut.schedule_at(at).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        sut.schedule_at(at).unwrap();
        assert_eq!(sut.pending_at(), Some(at));

        clock.advance(TimeDelta::minutes(10));
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
