//! Asynchronous subscriber with a live demand signal
//!
//! [`AsyncDemandingSubscriber`] decouples `publish` from processing. Events go
//! into a bounded queue and a single worker task hands them one at a time to
//! the inner subscriber.
//!
//! ```text
//! publish(events) ──► [bounded queue] ──► worker ──► inner.publish([event])
//!       │                                    │
//!       └── unprocessed += 1                 ├── error/panic → on_error
//!                                            └── unprocessed -= 1
//!
//! demand() = max(0, prefetch - unprocessed)
//! ```
//!
//! The queue holds `prefetch * 1.5 + 1` slots so that a publisher reacting
//! late to a demand of zero still has room. Once those slots are full,
//! `publish` waits for the worker.

use crate::error::{BusError, BusResult};
use crate::subscriber::{SharedSubscriber, Subscriber};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callback receiving errors that cannot be returned to a caller.
pub type ErrorCallback = Arc<dyn Fn(BusError) + Send + Sync>;

/// Bounded, demand-reporting asynchronous subscriber.
///
/// `publish` only confirms that events were accepted for processing. Failures
/// of the inner subscriber, including panics, are reported through the error
/// callback and never returned to the publisher.
///
/// Must be created inside a tokio runtime because construction spawns the
/// worker task.
pub struct AsyncDemandingSubscriber<E: Send + 'static> {
    sender: Mutex<Option<mpsc::Sender<E>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    unprocessed: Arc<AtomicUsize>,
    prefetch: usize,
    buffer: usize,
    on_error: ErrorCallback,
}

impl<E: Send + 'static> AsyncDemandingSubscriber<E> {
    /// Start a worker feeding `inner`.
    ///
    /// # Arguments
    ///
    /// * `inner` - Subscriber receiving events one at a time
    /// * `prefetch` - Logical capacity reported through `demand`
    /// * `on_error` - Receives inner failures; `None` discards them
    pub fn new(inner: SharedSubscriber<E>, prefetch: usize, on_error: Option<ErrorCallback>) -> Self {
        let buffer = prefetch + prefetch / 2 + 1;
        let (tx, rx) = mpsc::channel(buffer);
        let unprocessed = Arc::new(AtomicUsize::new(0));
        let on_error = on_error.unwrap_or_else(|| Arc::new(|_: BusError| {}));

        let worker = tokio::spawn(drain(rx, inner, unprocessed.clone(), on_error.clone()));

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            unprocessed,
            prefetch,
            buffer,
            on_error,
        }
    }

    /// Logical capacity.
    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Physical queue size.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer
    }

    /// Events accepted but not yet processed.
    pub fn unprocessed(&self) -> usize {
        self.unprocessed.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting events. Already queued events are still processed.
    ///
    /// Only the first call has an effect.
    pub fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_some() {
            tracing::debug!(unprocessed = self.unprocessed(), "Async subscriber closed");
        }
    }

    /// Close and wait until the worker has drained the queue.
    pub async fn shutdown(&self) {
        self.close();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Async subscriber worker failed");
            }
        }
    }

    fn current_sender(&self) -> Option<mpsc::Sender<E>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<E: Send + 'static> std::fmt::Debug for AsyncDemandingSubscriber<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDemandingSubscriber")
            .field("prefetch", &self.prefetch)
            .field("buffer", &self.buffer)
            .field("unprocessed", &self.unprocessed())
            .finish()
    }
}

#[async_trait]
impl<E: Send + 'static> Subscriber<E> for AsyncDemandingSubscriber<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let Some(sender) = self.current_sender() else {
            (self.on_error)(BusError::Closed);
            return Ok(());
        };

        for event in events {
            let reservation = Reservation::take(&self.unprocessed);
            if sender.send(event).await.is_err() {
                drop(reservation);
                (self.on_error)(BusError::Closed);
                break;
            }
            reservation.keep();
        }

        Ok(())
    }

    fn demand(&self) -> usize {
        self.prefetch.saturating_sub(self.unprocessed())
    }
}

/// Counts an event as unprocessed until it is queued or given back.
///
/// Dropping an un-kept reservation undoes the increment, so a publish
/// future canceled while waiting for queue space leaves the counter intact.
struct Reservation<'a> {
    counter: &'a AtomicUsize,
    kept: bool,
}

impl<'a> Reservation<'a> {
    fn take(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter,
            kept: false,
        }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Marks one event as processed when dropped.
struct Processed<'a>(&'a AtomicUsize);

impl Drop for Processed<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn drain<E: Send + 'static>(
    mut rx: mpsc::Receiver<E>,
    inner: SharedSubscriber<E>,
    unprocessed: Arc<AtomicUsize>,
    on_error: ErrorCallback,
) {
    while let Some(event) = rx.recv().await {
        let _processed = Processed(&unprocessed);

        match AssertUnwindSafe(inner.publish(vec![event])).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => on_error(err),
            Err(panic) => {
                let err = BusError::from_panic(panic.as_ref());
                tracing::error!(error = %err, "Subscriber panicked in async worker");
                on_error(err);
            }
        }
    }

    tracing::debug!("Async subscriber worker stopped");
}
