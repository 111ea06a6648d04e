//! Message middlewares and decoding
//!
//! The consumer chain is built from these pieces:
//!
//! ```text
//! RecoverMiddleware -> AckMiddleware -> subscriber
//! ```
//!
//! Messages are acknowledged only after the subscriber returns success, which
//! gives at-least-once delivery. A panicking subscriber is turned into a
//! reported error instead of tearing down the poll loop.

use crate::message::{Ack, Message};
use async_trait::async_trait;
use futures::FutureExt;
use platform_bus::{BusError, BusResult, ErrorCallback, Middleware, SharedSubscriber, Subscriber};
use serde::de::DeserializeOwned;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

fn acks(events: &[Message]) -> Vec<Ack> {
    events.iter().filter_map(|m| m.ack.clone()).collect()
}

/// Acknowledges every message of a batch once the rest of the chain succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckMiddleware;

#[async_trait]
impl Middleware<Message> for AckMiddleware {
    async fn call(&self, events: Vec<Message>, next: SharedSubscriber<Message>) -> BusResult<()> {
        let pending = acks(&events);
        next.publish(events).await?;

        for ack in pending {
            ack.ack().await?;
        }
        Ok(())
    }
}

/// Catches panics raised further down the chain.
///
/// A recovered panic is reported to the error callback and the batch counts
/// as handled. With `commit_on_panic` the batch is also acknowledged, so the
/// poisoned messages are not redelivered.
#[derive(Clone, Default)]
pub struct RecoverMiddleware {
    commit_on_panic: bool,
    on_error: Option<ErrorCallback>,
}

impl RecoverMiddleware {
    /// Create a recovering middleware, acking panicked batches when `commit_on_panic` is set.
    pub fn new(commit_on_panic: bool) -> Self {
        Self {
            commit_on_panic,
            on_error: None,
        }
    }

    /// Report recovered panics to `callback`.
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }
}

impl std::fmt::Debug for RecoverMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverMiddleware")
            .field("commit_on_panic", &self.commit_on_panic)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[async_trait]
impl Middleware<Message> for RecoverMiddleware {
    async fn call(&self, events: Vec<Message>, next: SharedSubscriber<Message>) -> BusResult<()> {
        let pending = acks(&events);

        let panic = match AssertUnwindSafe(next.publish(events)).catch_unwind().await {
            Ok(result) => return result,
            Err(panic) => BusError::from_panic(panic.as_ref()),
        };

        tracing::error!(error = %panic, "Recovered from subscriber panic");
        if let Some(callback) = &self.on_error {
            callback(panic);
        }

        if self.commit_on_panic {
            for ack in pending {
                if let Err(e) = ack.ack().await {
                    tracing::warn!(error = %e, "Failed to commit after panic");
                }
            }
        }
        Ok(())
    }
}

type DecodeFn<T> = dyn Fn(&Message) -> BusResult<T> + Send + Sync;

/// Subscriber decoding messages into `T` before handing them on.
///
/// A message that fails to decode fails the whole batch with
/// [`BusError::Transform`]; nothing of the batch reaches the inner subscriber.
pub struct DecodeSubscriber<T: Send + 'static> {
    inner: SharedSubscriber<T>,
    decode: Arc<DecodeFn<T>>,
}

impl<T: Send + 'static> DecodeSubscriber<T> {
    /// Decode every message with `decode` before handing it to `inner`.
    pub fn new(
        inner: SharedSubscriber<T>,
        decode: impl Fn(&Message) -> BusResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            decode: Arc::new(decode),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Subscriber<Message> for DecodeSubscriber<T> {
    async fn publish(&self, events: Vec<Message>) -> BusResult<()> {
        let decoded = events
            .iter()
            .map(|message| {
                (self.decode)(message).map_err(|e| {
                    tracing::warn!(topic = %message.topic, offset = ?message.offset, error = %e, "Failed to decode message");
                    match e {
                        BusError::Transform(_) => e,
                        other => BusError::transform(other),
                    }
                })
            })
            .collect::<BusResult<Vec<T>>>()?;

        self.inner.publish(decoded).await
    }

    fn demand(&self) -> usize {
        self.inner.demand()
    }
}

/// Decode message bodies as JSON into `T`.
pub fn decode_json<T>(inner: SharedSubscriber<T>) -> DecodeSubscriber<T>
where
    T: DeserializeOwned + Send + 'static,
{
    DecodeSubscriber::new(inner, |message: &Message| message.decode_json::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform_bus::{subscriber_with, SharedMiddleware, SubscriberFn, WithDemand};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counted_ack(counter: &Arc<AtomicUsize>) -> Ack {
        let counter = counter.clone();
        Ack::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn batch(acked: &Arc<AtomicUsize>) -> Vec<Message> {
        vec![
            Message::new("orders", "1").with_ack(counted_ack(acked)),
            Message::new("orders", "2").with_ack(counted_ack(acked)),
        ]
    }

    fn succeeding() -> SharedSubscriber<Message> {
        Arc::new(SubscriberFn::new(|_: Vec<Message>| async { Ok(()) }))
    }

    fn failing() -> SharedSubscriber<Message> {
        Arc::new(SubscriberFn::new(|_: Vec<Message>| async {
            Err(BusError::delivery("handler failed"))
        }))
    }

    fn panicking() -> SharedSubscriber<Message> {
        Arc::new(SubscriberFn::new(|events: Vec<Message>| async move {
            if !events.is_empty() {
                panic!("poison message");
            }
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_ack_after_success() {
        let acked = Arc::new(AtomicUsize::new(0));
        let chain = subscriber_with(succeeding(), vec![Arc::new(AckMiddleware) as SharedMiddleware<Message>]);

        chain.publish(batch(&acked)).await.unwrap();

        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_ack_after_failure() {
        let acked = Arc::new(AtomicUsize::new(0));
        let chain = subscriber_with(failing(), vec![Arc::new(AckMiddleware) as SharedMiddleware<Message>]);

        let err = chain.publish(batch(&acked)).await.unwrap_err();

        assert_eq!(err, BusError::delivery("handler failed"));
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recover_reports_panic() {
        let acked = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let recover = RecoverMiddleware::new(false)
            .with_error_callback(Arc::new(move |err: BusError| sink.lock().unwrap().push(err)));
        let chain = subscriber_with(
            panicking(),
            vec![
                Arc::new(recover) as SharedMiddleware<Message>,
                Arc::new(AckMiddleware),
            ],
        );

        chain.publish(batch(&acked)).await.unwrap();

        assert_eq!(
            *errors.lock().unwrap(),
            vec![BusError::Panicked("poison message".to_string())]
        );
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recover_commits_on_panic() {
        let acked = Arc::new(AtomicUsize::new(0));
        let chain = subscriber_with(
            panicking(),
            vec![
                Arc::new(RecoverMiddleware::new(true)) as SharedMiddleware<Message>,
                Arc::new(AckMiddleware),
            ],
        );

        chain.publish(batch(&acked)).await.unwrap();

        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recover_passes_errors_through() {
        let acked = Arc::new(AtomicUsize::new(0));
        let chain = subscriber_with(
            failing(),
            vec![Arc::new(RecoverMiddleware::new(true)) as SharedMiddleware<Message>],
        );

        let err = chain.publish(batch(&acked)).await.unwrap_err();

        assert_eq!(err, BusError::delivery("handler failed"));
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Invoice {
        number: u32,
    }

    #[tokio::test]
    async fn test_decode_json() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        let typed: SharedSubscriber<Invoice> = Arc::new(SubscriberFn::new(move |events: Vec<Invoice>| {
            let out = out.clone();
            async move {
                out.lock().unwrap().extend(events);
                Ok(())
            }
        }));
        let decoder = decode_json(typed);

        decoder
            .publish(vec![
                Message::new("invoices", r#"{"number":1}"#),
                Message::new("invoices", r#"{"number":2}"#),
            ])
            .await
            .unwrap();

        let err = decoder
            .publish(vec![
                Message::new("invoices", r#"{"number":3}"#),
                Message::new("invoices", "garbage"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Transform(_)));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Invoice { number: 1 }, Invoice { number: 2 }]
        );
    }

    #[test]
    fn test_decode_keeps_inner_demand() {
        let typed: SharedSubscriber<Invoice> = Arc::new(WithDemand::new(
            Arc::new(SubscriberFn::<Invoice>::none()),
            || 5,
        ));

        assert_eq!(decode_json(typed).demand(), 5);
    }
}
