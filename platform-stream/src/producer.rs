//! Producer contract and its subscriber adapter

use crate::message::Message;
use async_trait::async_trait;
use platform_bus::{BusError, BusResult, Subscriber};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handle to a producer.
pub type SharedProducer = Arc<dyn Producer>;

/// Write side of a broker client.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Hand `message` to the client without waiting for the broker.
    async fn send(&self, message: Message) -> BusResult<()>;

    /// Write `message` and wait for the broker to confirm it.
    async fn send_sync(&self, message: Message) -> BusResult<()>;

    /// Flush and release the client.
    async fn close(&self) -> BusResult<()>;
}

/// [`Producer::send_sync`] bounded by `cancel`.
///
/// Returns [`BusError::Canceled`] when `cancel` fires before the broker
/// confirms. The message may still have been written.
pub async fn send_sync_until(
    producer: &dyn Producer,
    message: Message,
    cancel: &CancellationToken,
) -> BusResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BusError::Canceled),
        result = producer.send_sync(message) => result,
    }
}

/// Subscriber writing every event to a producer, in order, with confirmation.
pub struct ProducerSubscriber {
    producer: SharedProducer,
}

impl ProducerSubscriber {
    pub fn new(producer: SharedProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Subscriber<Message> for ProducerSubscriber {
    async fn publish(&self, events: Vec<Message>) -> BusResult<()> {
        for message in events {
            let topic = message.topic.clone();
            if let Err(e) = self.producer.send_sync(message).await {
                tracing::warn!(topic = %topic, error = %e, "Failed to produce message");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<String>>,
        stall: bool,
    }

    #[async_trait]
    impl Producer for RecordingProducer {
        async fn send(&self, message: Message) -> BusResult<()> {
            self.sent.lock().unwrap().push(message.topic);
            Ok(())
        }

        async fn send_sync(&self, message: Message) -> BusResult<()> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if message.topic == "rejected" {
                return Err(BusError::transport("topic rejected"));
            }
            self.send(message).await
        }

        async fn close(&self) -> BusResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_producer_subscriber_sends_in_order() {
        let producer = Arc::new(RecordingProducer::default());
        let subscriber = ProducerSubscriber::new(producer.clone());

        subscriber
            .publish(vec![Message::new("a", "1"), Message::new("b", "2")])
            .await
            .unwrap();

        assert_eq!(*producer.sent.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_producer_subscriber_stops_at_first_failure() {
        let producer = Arc::new(RecordingProducer::default());
        let subscriber = ProducerSubscriber::new(producer.clone());

        let err = subscriber
            .publish(vec![
                Message::new("a", "1"),
                Message::new("rejected", "2"),
                Message::new("c", "3"),
            ])
            .await
            .unwrap_err();

        assert_eq!(err, BusError::transport("topic rejected"));
        assert_eq!(*producer.sent.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_send_sync_until_canceled() {
        let producer = RecordingProducer {
            stall: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = send_sync_until(&producer, Message::new("a", "1"), &cancel).await;

        assert_eq!(result, Err(BusError::Canceled));
        assert!(producer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_sync_until_completes() {
        let producer = RecordingProducer::default();
        let cancel = CancellationToken::new();

        send_sync_until(&producer, Message::new("a", "1"), &cancel)
            .await
            .unwrap();

        assert_eq!(*producer.sent.lock().unwrap(), vec!["a"]);
    }
}
