#![allow(dead_code)]

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use logfence::clock::ManualClock;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Fixed start instant shared by the integration tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 17, 12, 0, 0).unwrap()
}

pub fn clock_at_t0() -> ManualClock {
    ManualClock::new(t0())
}

/// Let spawned timer tasks observe the latest clock value.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(clock: &ManualClock, delta: TimeDelta) {
    settle().await;
    clock.advance(delta);
    settle().await;
}

#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture every event (down to TRACE) emitted on this thread while the guard lives.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_max_level(tracing::Level::TRACE)
        .with_target(true)
        .without_time()
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (writer, guard)
}
