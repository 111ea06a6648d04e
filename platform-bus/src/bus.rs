//! Event bus implementation
//!
//! This module provides the topic-keyed event bus abstraction and its
//! in-process synchronous implementation.
//!
//! [`SyncEventBus`] delivers each notification to every subscriber of the
//! topic, in registration order, before `notify` returns. The first failing
//! subscriber aborts the notification and its error is returned.

use crate::error::BusResult;
use crate::subscriber::{Publisher, SharedSubscriber, Subscriber};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Event bus trait for topic-based publish/subscribe.
#[async_trait]
pub trait EventBus<E: Send + 'static>: Send + Sync {
    /// Deliver `events` to every subscriber of `topic`.
    async fn notify(&self, topic: &str, events: Vec<E>) -> BusResult<()>;

    /// Register `subscriber` for notifications on `topic`.
    ///
    /// Registering the same subscriber twice delivers every event twice.
    async fn subscribe(&self, topic: &str, subscriber: SharedSubscriber<E>) -> BusResult<()>;

    /// Release resources held by the bus.
    async fn close(&self) -> BusResult<()>;
}

/// Shared handle to an event bus.
pub type SharedEventBus<E> = Arc<dyn EventBus<E>>;

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Topics with at least one subscriber
    pub topics: usize,
    /// Registered subscriptions across all topics
    pub subscriptions: usize,
    /// Events passed to `notify`
    pub events_notified: u64,
    /// Successful subscriber deliveries
    pub deliveries: u64,
    /// Failed subscriber deliveries
    pub failures: u64,
}

/// In-memory synchronous event bus.
///
/// Topics are arbitrary case-sensitive strings. Subscribers run on the
/// caller's task; the registry lock is never held while a subscriber runs,
/// so subscribers may register new subscriptions from inside `publish`.
pub struct SyncEventBus<E: Send + 'static> {
    /// Topic subscribers, in registration order
    subscribers: RwLock<HashMap<String, Vec<SharedSubscriber<E>>>>,
    events_notified: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
}

impl<E: Send + 'static> std::fmt::Debug for SyncEventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEventBus")
            .field("events_notified", &self.events_notified.load(Ordering::Relaxed))
            .finish()
    }
}

impl<E: Send + 'static> SyncEventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            events_notified: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Number of subscriptions on `topic`.
    pub async fn subscribers(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Get event bus statistics.
    pub async fn stats(&self) -> EventBusStats {
        let subscribers = self.subscribers.read().await;

        EventBusStats {
            topics: subscribers.len(),
            subscriptions: subscribers.values().map(Vec::len).sum(),
            events_notified: self.events_notified.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the subscribers of `topic`.
    async fn snapshot(&self, topic: &str) -> Vec<SharedSubscriber<E>> {
        self.subscribers
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

impl<E: Send + 'static> Default for SyncEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Clone + Send + 'static> EventBus<E> for SyncEventBus<E> {
    async fn notify(&self, topic: &str, events: Vec<E>) -> BusResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        self.events_notified
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        let subscribers = self.snapshot(topic).await;
        if subscribers.is_empty() {
            tracing::trace!(topic = %topic, "No subscribers for topic");
            return Ok(());
        }

        for subscriber in &subscribers {
            if let Err(e) = subscriber.publish(events.clone()).await {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %topic, error = %e, "Subscriber failed, notification aborted");
                return Err(e);
            }
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, subscriber: SharedSubscriber<E>) -> BusResult<()> {
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push(subscriber);

        tracing::debug!(topic = %topic, "Subscriber registered");

        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        tracing::debug!("SyncEventBus closed");
        Ok(())
    }
}

/// [`Publisher`] registering subscribers on one topic of a bus.
pub struct TopicPublisher<E: Send + 'static> {
    bus: SharedEventBus<E>,
    topic: String,
}

impl<E: Send + 'static> TopicPublisher<E> {
    /// Publisher for `topic` on `bus`.
    pub fn new(bus: SharedEventBus<E>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// The topic subscribers are registered on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl<E: Send + 'static> Publisher<E> for TopicPublisher<E> {
    async fn subscribe(&self, subscriber: SharedSubscriber<E>) -> BusResult<()> {
        self.bus.subscribe(&self.topic, subscriber).await
    }
}

/// [`Subscriber`] notifying one topic of a bus.
///
/// Lets producers that only know the subscriber contract feed a bus.
pub struct TopicSubscriber<E: Send + 'static> {
    bus: SharedEventBus<E>,
    topic: String,
}

impl<E: Send + 'static> TopicSubscriber<E> {
    /// Subscriber notifying `topic` on `bus`.
    pub fn new(bus: SharedEventBus<E>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<E: Send + 'static> Subscriber<E> for TopicSubscriber<E> {
    async fn publish(&self, events: Vec<E>) -> BusResult<()> {
        self.bus.notify(&self.topic, events).await
    }
}

// ============================================================================
// Tests
// ============================================================================
