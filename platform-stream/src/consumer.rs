//! Transport-backed consumer
//!
//! [`TransportConsumer`] is a [`Publisher<Message>`] driven by a
//! [`Transport`](crate::transport::Transport). Subscribing joins the consumer
//! group and spawns the poll loop; the loop delivers through:
//!
//! ```text
//! RecoverMiddleware -> AckMiddleware -> prefix strip -> subscriber
//! ```
//!
//! When the loop ends, for whatever reason, it leaves the group and closes
//! the transport. [`Consumer::close`] stops the loop and reports the fatal
//! error that ended it, if any.

use crate::config::ConsumerConfig;
use crate::message::Message;
use crate::middleware::{AckMiddleware, RecoverMiddleware};
use crate::poller::{run_poll_loop, DemandPoller, Pollable, Poller};
use crate::topic::TopicPrefix;
use crate::transport::SharedTransport;
use async_trait::async_trait;
use platform_bus::{
    subscriber_with, BusError, BusResult, ErrorCallback, Publisher, SharedMiddleware, SharedSubscriber,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A message publisher that can be shut down.
#[async_trait]
pub trait Consumer: Publisher<Message> {
    /// Stop consuming and release the underlying client.
    async fn close(&self) -> BusResult<()>;
}

/// [`Consumer`] polling a transport in a background task.
pub struct TransportConsumer {
    transport: SharedTransport,
    config: ConsumerConfig,
    prefix: TopicPrefix,
    cancel: CancellationToken,
    on_error: Option<ErrorCallback>,
    poll_task: Mutex<Option<JoinHandle<BusResult<()>>>>,
}

impl TransportConsumer {
    /// Create a consumer from a validated configuration.
    pub fn new(transport: SharedTransport, config: ConsumerConfig) -> BusResult<Self> {
        config.validate()?;

        Ok(Self {
            transport,
            prefix: TopicPrefix::new(config.topic_prefix.clone()),
            config,
            cancel: CancellationToken::new(),
            on_error: None,
            poll_task: Mutex::new(None),
        })
    }

    /// Stop the poll loop when `parent` is canceled.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Report subscriber panics to `callback`.
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Configuration the consumer was created with.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Whether the poll loop is still running.
    pub async fn is_running(&self) -> bool {
        self.poll_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn delivery_chain(&self, subscriber: SharedSubscriber<Message>) -> SharedSubscriber<Message> {
        let mut recover = RecoverMiddleware::new(self.config.commit_on_panic);
        if let Some(callback) = &self.on_error {
            recover = recover.with_error_callback(callback.clone());
        }

        let middlewares: Vec<SharedMiddleware<Message>> =
            vec![Arc::new(recover), Arc::new(AckMiddleware), self.prefix.inbound()];
        subscriber_with(subscriber, middlewares)
    }

    fn poller(&self, subscriber: SharedSubscriber<Message>) -> Box<dyn Pollable> {
        let poller = Poller::new(
            self.transport.clone(),
            self.delivery_chain(subscriber),
            self.config.poll_timeout(),
        );
        if self.config.respect_demand {
            Box::new(DemandPoller::new(poller))
        } else {
            Box::new(poller)
        }
    }
}

#[async_trait]
impl Publisher<Message> for TransportConsumer {
    async fn subscribe(&self, subscriber: SharedSubscriber<Message>) -> BusResult<()> {
        let mut poll_task = self.poll_task.lock().await;
        if poll_task.is_some() {
            return Err(BusError::Subscribe("consumer already has a subscriber".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let topics: Vec<String> = self
            .config
            .topics
            .iter()
            .map(|topic| self.prefix.apply(topic))
            .collect();
        self.transport
            .subscribe(&topics)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let poller = self.poller(subscriber);
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();

        tracing::info!(topics = ?topics, respect_demand = self.config.respect_demand, "Starting consumer");
        *poll_task = Some(tokio::spawn(async move {
            let result = run_poll_loop(poller.as_ref(), cancel).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Consumer poll loop failed");
            }

            if let Err(e) = transport.unsubscribe().await {
                tracing::warn!(error = %e, "Failed to leave consumer group");
            }
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "Failed to close transport");
            }
            tracing::info!("Consumer stopped");
            result
        }));

        Ok(())
    }
}

#[async_trait]
impl Consumer for TransportConsumer {
    async fn close(&self) -> BusResult<()> {
        self.cancel.cancel();

        let task = self.poll_task.lock().await.take();
        match task {
            Some(task) => task.await.map_err(|e| BusError::Panicked(e.to_string()))?,
            None => self.transport.close().await,
        }
    }
}
