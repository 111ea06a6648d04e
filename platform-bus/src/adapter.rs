//! Type-adapting event bus wrapper
//!
//! [`EventBusAdapter`] presents an `EventBus<T>` on top of any `EventBus<K>`.
//! Outgoing events are converted with a write transform, incoming events with
//! a read transform. Both transforms may fail.
//!
//! - `notify` is all-or-nothing: if any event fails to convert, nothing is
//!   notified and the conversion error is returned.
//! - On the subscribe side a failing event aborts its batch as a delivery
//!   failure, unless a read-error hook is installed. The hook returns `Ok(())`
//!   to skip the event or an error to abort the batch.

use crate::bus::{EventBus, SharedEventBus};
use crate::combinators::WithDemand;
use crate::error::{BusError, BusResult};
use crate::subscriber::{SharedSubscriber, SubscriberFn};
use async_trait::async_trait;
use std::sync::Arc;

type WriteFn<T, K> = dyn Fn(T) -> BusResult<K> + Send + Sync;
type ReadFn<K, T> = dyn Fn(K) -> BusResult<T> + Send + Sync;
type ReadErrorHook = dyn Fn(BusError) -> BusResult<()> + Send + Sync;

/// Presents an `EventBus<T>` backed by an `EventBus<K>`.
///
/// # Example
///
/// ```rust,no_run
/// use platform_bus::{BusError, EventBus, EventBusAdapter, SyncEventBus};
/// use std::sync::Arc;
///
/// async fn example() -> Result<(), BusError> {
///     let raw: Arc<SyncEventBus<String>> = Arc::new(SyncEventBus::new());
///     let numbers = EventBusAdapter::<u64, String>::new(
///         raw,
///         |n: u64| Ok(n.to_string()),
///         |s: String| s.parse::<u64>().map_err(BusError::transform),
///     );
///
///     numbers.notify("counts", vec![1, 2, 3]).await
/// }
/// ```
pub struct EventBusAdapter<T, K: Send + 'static> {
    inner: SharedEventBus<K>,
    write: Arc<WriteFn<T, K>>,
    read: Arc<ReadFn<K, T>>,
    on_read_error: Option<Arc<ReadErrorHook>>,
}

impl<T, K> EventBusAdapter<T, K>
where
    T: Send + 'static,
    K: Send + 'static,
{
    /// Adapt `inner` with the given transforms.
    ///
    /// # Arguments
    ///
    /// * `inner` - Bus carrying `K` events
    /// * `write` - Converts events passed to `notify`
    /// * `read` - Converts events delivered to subscribers
    pub fn new(
        inner: SharedEventBus<K>,
        write: impl Fn(T) -> BusResult<K> + Send + Sync + 'static,
        read: impl Fn(K) -> BusResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            write: Arc::new(write),
            read: Arc::new(read),
            on_read_error: None,
        }
    }

    /// Decide per event what happens when the read transform fails.
    ///
    /// `Ok(())` skips the event; an error aborts the batch with that error.
    pub fn with_read_error_hook(
        mut self,
        hook: impl Fn(BusError) -> BusResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_read_error = Some(Arc::new(hook));
        self
    }

    /// Wrap a `T` subscriber into the `K` subscriber registered on the inner bus.
    fn translate(&self, subscriber: SharedSubscriber<T>) -> SharedSubscriber<K> {
        let read = self.read.clone();
        let hook = self.on_read_error.clone();
        let target = subscriber.clone();

        let translated: SharedSubscriber<K> = Arc::new(SubscriberFn::new(move |events: Vec<K>| {
            let read = read.clone();
            let hook = hook.clone();
            let target = target.clone();
            async move {
                let mut converted = Vec::with_capacity(events.len());
                for event in events {
                    match read(event) {
                        Ok(event) => converted.push(event),
                        Err(err) => match &hook {
                            Some(hook) => hook(err)?,
                            None => return Err(BusError::delivery(err)),
                        },
                    }
                }

                if converted.is_empty() {
                    return Ok(());
                }
                target.publish(converted).await
            }
        }));

        Arc::new(WithDemand::new(translated, move || subscriber.demand()))
    }
}

#[async_trait]
impl<T, K> EventBus<T> for EventBusAdapter<T, K>
where
    T: Send + 'static,
    K: Send + 'static,
{
    async fn notify(&self, topic: &str, events: Vec<T>) -> BusResult<()> {
        let converted = events
            .into_iter()
            .map(|event| (self.write)(event))
            .collect::<BusResult<Vec<K>>>()?;

        self.inner.notify(topic, converted).await
    }

    async fn subscribe(&self, topic: &str, subscriber: SharedSubscriber<T>) -> BusResult<()> {
        let translated = self.translate(subscriber);
        self.inner.subscribe(topic, translated).await
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.close().await
    }
}
