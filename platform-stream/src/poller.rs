//! Transport polling
//!
//! A [`Poller`] turns one transport poll into bus deliveries:
//!
//! - a message is forwarded to the subscriber with an offset-committing [`Ack`]
//! - an assignment change is applied to the transport
//! - a transient transport error is logged and polling continues
//! - a fatal transport error ends polling
//!
//! Pause and resume act on the whole current assignment and are idempotent.
//! [`DemandPoller`] pauses while the subscriber reports zero demand and
//! resumes once it reports room again, so a slow subscriber holds messages
//! at the broker instead of in memory.

use crate::message::{Ack, Message};
use crate::transport::{Partition, SharedTransport, TransportEvent};
use async_trait::async_trait;
use platform_bus::{BusError, BusResult, SharedSubscriber};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One iteration of a polling loop.
#[async_trait]
pub trait Pollable: Send + Sync {
    /// Wait for and handle a single transport event.
    async fn poll(&self) -> BusResult<()>;
}

/// Bridge from a [`Transport`](crate::transport::Transport) to a message subscriber.
pub struct Poller {
    transport: SharedTransport,
    subscriber: SharedSubscriber<Message>,
    timeout: Duration,
    paused: Mutex<bool>,
}

impl Poller {
    /// Create a poller waiting at most `timeout` per transport poll.
    pub fn new(transport: SharedTransport, subscriber: SharedSubscriber<Message>, timeout: Duration) -> Self {
        Self {
            transport,
            subscriber,
            timeout,
            paused: Mutex::new(false),
        }
    }

    /// Subscriber receiving polled messages.
    pub fn subscriber(&self) -> &SharedSubscriber<Message> {
        &self.subscriber
    }

    /// Whether the assignment is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.lock_paused()
    }

    /// Pause the current assignment. No-op when already paused.
    ///
    /// On error the paused flag is left unchanged.
    pub fn pause(&self) -> BusResult<()> {
        let mut paused = self.lock_paused();
        if *paused {
            return Ok(());
        }
        self.pause_assignment()?;
        *paused = true;
        tracing::debug!("Paused transport");
        Ok(())
    }

    /// Resume the current assignment. No-op when not paused.
    ///
    /// On error the paused flag is left unchanged.
    pub fn resume(&self) -> BusResult<()> {
        let mut paused = self.lock_paused();
        if !*paused {
            return Ok(());
        }
        let partitions = self.transport.assignment()?;
        self.transport.resume(&partitions)?;
        *paused = false;
        tracing::debug!(partitions = partitions.len(), "Resumed transport");
        Ok(())
    }

    // The flag only changes after a successful transport call, so a poisoned
    // value is still accurate.
    fn lock_paused(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pause_assignment(&self) -> BusResult<()> {
        let partitions = self.transport.assignment()?;
        self.transport.pause(&partitions)
    }

    /// Attach an ack committing the message's offset, unless it carries one.
    fn with_commit(&self, mut message: Message) -> Message {
        if message.ack.is_some() {
            return message;
        }
        let (Some(partition), Some(offset)) = (message.partition, message.offset) else {
            return message;
        };

        let transport = self.transport.clone();
        let target = Partition::new(message.topic.clone(), partition);
        message.ack = Some(Ack::new(move || {
            let transport = transport.clone();
            let target = target.clone();
            async move { transport.commit(&target, offset).await }
        }));
        message
    }

    async fn deliver(&self, message: Message) -> BusResult<()> {
        if self.is_paused() {
            // Partitions assigned after the pause may still be fetching.
            tracing::warn!(topic = %message.topic, "Received message while paused, pausing again");
            let _paused = self.lock_paused();
            if let Err(e) = self.pause_assignment() {
                tracing::warn!(error = %e, "Failed to pause transport again");
            }
        }

        let topic = message.topic.clone();
        let message = self.with_commit(message);
        if let Err(e) = self.subscriber.publish(vec![message]).await {
            tracing::error!(topic = %topic, error = %e, "Subscriber failed to handle message");
            return Err(e);
        }
        Ok(())
    }

    fn assign(&self, partitions: Vec<Partition>) -> BusResult<()> {
        // Hold the flag so a concurrent resume cannot miss the new partitions.
        let paused = self.lock_paused();
        self.transport.assign(&partitions)?;
        if *paused {
            self.transport.pause(&partitions)?;
        }
        tracing::info!(partitions = partitions.len(), paused = *paused, "Partitions assigned");
        Ok(())
    }

    fn revoke(&self, partitions: Vec<Partition>) -> BusResult<()> {
        self.transport.unassign(&partitions)?;
        tracing::info!(partitions = partitions.len(), "Partitions revoked");
        Ok(())
    }
}

#[async_trait]
impl Pollable for Poller {
    async fn poll(&self) -> BusResult<()> {
        let Some(event) = self.transport.poll(self.timeout).await else {
            return Ok(());
        };

        match event {
            TransportEvent::Message(message) => self.deliver(message).await,
            TransportEvent::Assigned(partitions) => self.assign(partitions),
            TransportEvent::Revoked(partitions) => self.revoke(partitions),
            TransportEvent::Error(err) if err.fatal => {
                tracing::error!(error = %err, "Fatal transport error");
                Err(BusError::transport(err))
            }
            TransportEvent::Error(err) => {
                tracing::warn!(error = %err, "Transport error");
                Ok(())
            }
        }
    }
}

/// [`Poller`] that pauses the transport while its subscriber has no demand.
pub struct DemandPoller {
    poller: Poller,
}

impl DemandPoller {
    /// Wrap `poller`, consulting its subscriber's demand before every poll.
    pub fn new(poller: Poller) -> Self {
        Self { poller }
    }

    /// Whether the wrapped poller is paused.
    pub fn is_paused(&self) -> bool {
        self.poller.is_paused()
    }

    /// See [`Poller::pause`].
    pub fn pause(&self) -> BusResult<()> {
        self.poller.pause()
    }

    /// See [`Poller::resume`].
    pub fn resume(&self) -> BusResult<()> {
        self.poller.resume()
    }
}

#[async_trait]
impl Pollable for DemandPoller {
    async fn poll(&self) -> BusResult<()> {
        if self.poller.subscriber.demand() == 0 {
            self.poller.pause()?;
        } else {
            self.poller.resume()?;
        }
        self.poller.poll().await
    }
}

/// Drive `poller` until `cancel` fires or a poll fails.
///
/// Cancellation is checked between polls and while a poll waits; an
/// in-flight delivery is abandoned when `cancel` fires.
pub async fn run_poll_loop(poller: &dyn Pollable, cancel: CancellationToken) -> BusResult<()> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Poll loop canceled");
                return Ok(());
            }
            result = poller.poll() => result?,
        }
    }
}
