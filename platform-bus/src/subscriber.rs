//! Subscriber and publisher contracts
//!
//! A [`Subscriber`] accepts batches of events and reports how many more it is
//! willing to take right now through [`Subscriber::demand`]. A [`Publisher`]
//! lets a subscriber register for future deliveries.
//!
//! Plain closures can stand in for either contract through [`SubscriberFn`]
//! and [`PublisherFn`]. Both carry an optional closure; the empty value is a
//! successful no-op rather than an error.

use crate::error::BusResult;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Demand reported by subscribers that place no bound on intake.
pub const UNBOUNDED: usize = usize::MAX;

/// Shared handle to a subscriber.
pub type SharedSubscriber<E> = Arc<dyn Subscriber<E>>;

/// Receiver of event batches.
///
/// Implementations must treat an empty batch as a no-op.
#[async_trait]
pub trait Subscriber<E: Send + 'static>: Send + Sync {
    /// Deliver a batch of events. May wait until the subscriber has room.
    async fn publish(&self, events: Vec<E>) -> BusResult<()>;

    /// Snapshot of the remaining intake capacity.
    ///
    /// Must not block. `0` means "do not send more right now";
    /// [`UNBOUNDED`] means there is no bound at all.
    fn demand(&self) -> usize {
        UNBOUNDED
    }
}

/// Source of events that subscribers can register with.
#[async_trait]
pub trait Publisher<E: Send + 'static>: Send + Sync {
    /// Register a subscriber for future deliveries.
    async fn subscribe(&self, subscriber: SharedSubscriber<E>) -> BusResult<()>;
}

type PublishFn<E> = dyn Fn(Vec<E>) -> BoxFuture<'static, BusResult<()>> + Send + Sync;

/// Closure-backed [`Subscriber`] with unbounded demand.
///
/// ```rust,no_run
/// use platform_bus::{Subscriber, SubscriberFn};
///
/// async fn example() {
///     let printer = SubscriberFn::new(|events: Vec<String>| async move {
///         for event in events {
///             println!("{event}");
///         }
///         Ok(())
///     });
///
///     printer.publish(vec!["hello".to_string()]).await.unwrap();
/// }
/// ```
pub struct SubscriberFn<E> {
    f: Option<Arc<PublishFn<E>>>,
}

impl<E: Send + 'static> SubscriberFn<E> {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self {
            f: Some(Arc::new(move |events| f(events).boxed())),
        }
    }

    /// A subscriber without a closure. Every publish succeeds and does nothing.
    pub fn none() -> Self {
        Self { f: None }
    }

    /// Whether this subscriber carries no closure.
    pub fn is_none(&self) -> bool {
        self.f.is_none()
    }
}

impl<E> Clone for SubscriberFn<E> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<E: Send + 'static> Default for SubscriberFn<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E> fmt::Debug for SubscriberFn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberFn")
            .field("set", &self.f.is_some())
            .finish()
    }
}

#[async_trait]
impl<E: Send + 'static> Subscriber<E> for SubscriberFn<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        match &self.f {
            Some(f) if !events.is_empty() => f(events).await,
            _ => Ok(()),
        }
    }
}

type SubscribeFn<E> = dyn Fn(SharedSubscriber<E>) -> BoxFuture<'static, BusResult<()>> + Send + Sync;

/// Closure-backed [`Publisher`].
pub struct PublisherFn<E: Send + 'static> {
    f: Option<Arc<SubscribeFn<E>>>,
}

impl<E: Send + 'static> PublisherFn<E> {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(SharedSubscriber<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self {
            f: Some(Arc::new(move |subscriber| f(subscriber).boxed())),
        }
    }

    /// A publisher without a closure. Every subscribe succeeds and does nothing.
    pub fn none() -> Self {
        Self { f: None }
    }

    /// Whether this publisher carries no closure.
    pub fn is_none(&self) -> bool {
        self.f.is_none()
    }
}

impl<E: Send + 'static> Clone for PublisherFn<E> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<E: Send + 'static> Default for PublisherFn<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E: Send + 'static> fmt::Debug for PublisherFn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherFn")
            .field("set", &self.f.is_some())
            .finish()
    }
}

#[async_trait]
impl<E: Send + 'static> Publisher<E> for PublisherFn<E> {
    async fn subscribe(&self, subscriber: SharedSubscriber<E>) -> BusResult<()> {
        match &self.f {
            Some(f) => f(subscriber).await,
            None => Ok(()),
        }
    }
}
