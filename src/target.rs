//! Downstream collaborator interface.
//!
//! A [`Target`] is whatever the limiting layer forwards to: a mail sender, a file writer,
//! another wrapper. Writes are synchronous and must not block indefinitely; flush completion
//! is signalled asynchronously through a [`FlushSignal`], exactly once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Boxed error reported by a downstream flush.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of handing one item to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The item went downstream.
    Forwarded,
    /// The item was dropped by a limit. Not an error.
    Discarded,
}

impl Delivery {
    pub fn is_forwarded(self) -> bool {
        matches!(self, Delivery::Forwarded)
    }
}

/// One-shot completion handle for a flush request.
///
/// Consuming [`complete`](Self::complete) guarantees at most one completion; dropping the
/// signal closes the receiving side.
#[derive(Debug, Default)]
pub struct FlushSignal {
    tx: Option<oneshot::Sender<Result<(), BoxError>>>,
}

/// Receiving side of a [`FlushSignal`].
pub type FlushReceiver = oneshot::Receiver<Result<(), BoxError>>;

impl FlushSignal {
    /// Create a signal together with the receiver the originator awaits.
    pub fn channel() -> (Self, FlushReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A signal nobody waits for, used for internally triggered flushes.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn complete(mut self, result: Result<(), BoxError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Complete successfully without anything having been flushed.
    pub fn skip(self) {
        self.complete(Ok(()));
    }
}

/// The downstream stage of a logging pipeline.
pub trait Target<T>: Send + Sync {
    /// Deliver one item.
    fn write(&self, item: T) -> Delivery;

    /// Flush buffered items and complete `signal` when done.
    fn flush(&self, signal: FlushSignal);

    /// Release resources. Called once during shutdown.
    fn close(&self) {}
}

impl<T, W> Target<T> for Arc<W>
where
    W: Target<T> + ?Sized,
{
    fn write(&self, item: T) -> Delivery {
        (**self).write(item)
    }

    fn flush(&self, signal: FlushSignal) {
        (**self).flush(signal)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Spy target that counts writes, flushes and closes, and keeps written items.
#[derive(Debug)]
pub struct CountingTarget<T> {
    written: Mutex<Vec<T>>,
    flushes: AtomicUsize,
    closes: AtomicUsize,
}

impl<T> CountingTarget<T> {
    pub fn new() -> Self {
        Self { written: Mutex::new(Vec::new()), flushes: AtomicUsize::new(0), closes: AtomicUsize::new(0) }
    }

    pub fn write_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.written.lock().clone()
    }
}

impl<T> Default for CountingTarget<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Target<T> for CountingTarget<T> {
    fn write(&self, item: T) -> Delivery {
        self.written.lock().push(item);
        Delivery::Forwarded
    }

    fn flush(&self, signal: FlushSignal) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        signal.skip();
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
