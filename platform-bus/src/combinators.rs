//! Subscriber combinators
//!
//! Adapters that compose subscribers without changing the [`Subscriber`]
//! contract:
//!
//! - [`MapSubscriber`]: exposes a `Subscriber<T>` in front of a `Subscriber<K>`
//! - [`WithDemand`]: replaces the demand signal of a subscriber
//! - [`subscriber_with`]: wraps a subscriber in a middleware chain
//! - [`SubscribeAll`]: sequential fan-out with optional error interception
//!
//! ## Middleware order
//!
//! ```text
//! subscriber_with(sub, [m1, m2])
//!
//! publish ──► m1 (before) ──► m2 (before) ──► sub.publish
//!                                                │
//! result  ◄── m1 (after)  ◄── m2 (after)  ◄──────┘
//! ```

use crate::error::{BusError, BusResult};
use crate::subscriber::{SharedSubscriber, Subscriber, UNBOUNDED};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Presents a `Subscriber<T>` that forwards to a `Subscriber<K>`.
///
/// Every event is mapped before forwarding; demand is the inner demand.
pub struct MapSubscriber<T, K: Send + 'static> {
    inner: SharedSubscriber<K>,
    map: Arc<dyn Fn(T) -> K + Send + Sync>,
}

impl<T, K> MapSubscriber<T, K>
where
    T: Send + 'static,
    K: Send + 'static,
{
    /// Wrap `inner`, applying `map` to every event.
    pub fn new(inner: SharedSubscriber<K>, map: impl Fn(T) -> K + Send + Sync + 'static) -> Self {
        Self {
            inner,
            map: Arc::new(map),
        }
    }
}

#[async_trait]
impl<T, K> Subscriber<T> for MapSubscriber<T, K>
where
    T: Send + 'static,
    K: Send + 'static,
{
    async fn publish(&self, events: Vec<T>) -> BusResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mapped: Vec<K> = events.into_iter().map(|event| (self.map)(event)).collect();
        self.inner.publish(mapped).await
    }

    fn demand(&self) -> usize {
        self.inner.demand()
    }
}

type DemandFn = dyn Fn() -> usize + Send + Sync;

/// Overrides the demand of a subscriber while delegating publish unchanged.
pub struct WithDemand<E: Send + 'static> {
    inner: SharedSubscriber<E>,
    demand: Option<Arc<DemandFn>>,
}

impl<E: Send + 'static> WithDemand<E> {
    /// Report demand through `demand` instead of the inner subscriber.
    pub fn new(inner: SharedSubscriber<E>, demand: impl Fn() -> usize + Send + Sync + 'static) -> Self {
        Self {
            inner,
            demand: Some(Arc::new(demand)),
        }
    }

    /// Always report [`UNBOUNDED`] demand.
    pub fn unbounded(inner: SharedSubscriber<E>) -> Self {
        Self {
            inner,
            demand: None,
        }
    }
}

#[async_trait]
impl<E: Send + 'static> Subscriber<E> for WithDemand<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        self.inner.publish(events).await
    }

    fn demand(&self) -> usize {
        match &self.demand {
            Some(demand) => demand(),
            None => UNBOUNDED,
        }
    }
}

/// Shared handle to a middleware.
pub type SharedMiddleware<E> = Arc<dyn Middleware<E>>;

/// Interceptor around a subscriber's publish.
///
/// A middleware decides whether, when and with which events `next` runs.
/// It never changes the demand seen by callers of the chain.
#[async_trait]
pub trait Middleware<E: Send + 'static>: Send + Sync {
    /// Handle `events`, usually by calling `next.publish`.
    async fn call(&self, events: Vec<E>, next: SharedSubscriber<E>) -> BusResult<()>;
}

type CallFn<E> = dyn Fn(Vec<E>, SharedSubscriber<E>) -> BoxFuture<'static, BusResult<()>> + Send + Sync;

/// Closure-backed [`Middleware`]. The empty value passes events straight to `next`.
pub struct MiddlewareFn<E: Send + 'static> {
    f: Option<Arc<CallFn<E>>>,
}

impl<E: Send + 'static> MiddlewareFn<E> {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<E>, SharedSubscriber<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self {
            f: Some(Arc::new(move |events, next| f(events, next).boxed())),
        }
    }

    /// A pass-through middleware.
    pub fn none() -> Self {
        Self { f: None }
    }
}

impl<E: Send + 'static> Clone for MiddlewareFn<E> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<E: Send + 'static> Default for MiddlewareFn<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E: Send + 'static> fmt::Debug for MiddlewareFn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareFn")
            .field("set", &self.f.is_some())
            .finish()
    }
}

#[async_trait]
impl<E: Send + 'static> Middleware<E> for MiddlewareFn<E> {
    async fn call(&self, events: Vec<E>, next: SharedSubscriber<E>) -> BusResult<()> {
        match &self.f {
            Some(f) => f(events, next).await,
            None => next.publish(events).await,
        }
    }
}

/// One link of a middleware chain.
struct Chained<E: Send + 'static> {
    middleware: SharedMiddleware<E>,
    next: SharedSubscriber<E>,
}

#[async_trait]
impl<E: Send + 'static> Subscriber<E> for Chained<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.middleware.call(events, self.next.clone()).await
    }

    fn demand(&self) -> usize {
        self.next.demand()
    }
}

/// Wrap `subscriber` in `middlewares`.
///
/// The first middleware given runs outermost. The chain reports the demand
/// of `subscriber` itself.
pub fn subscriber_with<E, I>(subscriber: SharedSubscriber<E>, middlewares: I) -> SharedSubscriber<E>
where
    E: Send + 'static,
    I: IntoIterator<Item = SharedMiddleware<E>>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut next = subscriber;
    for middleware in middlewares.into_iter().rev() {
        next = Arc::new(Chained { middleware, next });
    }
    next
}

/// Decision returned by a fan-out error interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Swallow the error and deliver to the remaining subscribers
    Continue,
    /// Swallow the error and stop the fan-out, reporting success
    Stop,
    /// Abort the fan-out with this error
    Fail(BusError),
}

type InterceptFn = dyn Fn(BusError) -> Interception + Send + Sync;

/// Delivers every batch to each member in order.
///
/// Without an interceptor the first error aborts the fan-out and is returned.
/// Demand is the smallest demand of any member.
pub struct SubscribeAll<E: Send + 'static> {
    subscribers: Vec<SharedSubscriber<E>>,
    interceptor: Option<Arc<InterceptFn>>,
}

impl<E: Clone + Send + 'static> SubscribeAll<E> {
    /// Fan out to `subscribers` in the given order.
    pub fn new(subscribers: Vec<SharedSubscriber<E>>) -> Self {
        Self {
            subscribers,
            interceptor: None,
        }
    }

    /// Route member errors through `interceptor`.
    pub fn with_interceptor(
        mut self,
        interceptor: impl Fn(BusError) -> Interception + Send + Sync + 'static,
    ) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[async_trait]
impl<E: Clone + Send + 'static> Subscriber<E> for SubscribeAll<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        for subscriber in &self.subscribers {
            let Err(err) = subscriber.publish(events.clone()).await else {
                continue;
            };

            match &self.interceptor {
                None => return Err(err),
                Some(intercept) => match intercept(err) {
                    Interception::Continue => continue,
                    Interception::Stop => return Ok(()),
                    Interception::Fail(err) => return Err(err),
                },
            }
        }

        Ok(())
    }

    fn demand(&self) -> usize {
        self.subscribers
            .iter()
            .map(|subscriber| subscriber.demand())
            .min()
            .unwrap_or(UNBOUNDED)
    }
}

/// Fan out to `subscribers` in order, stopping at the first error.
pub fn subscribe_all<E: Clone + Send + 'static>(subscribers: Vec<SharedSubscriber<E>>) -> SharedSubscriber<E> {
    Arc::new(SubscribeAll::new(subscribers))
}
