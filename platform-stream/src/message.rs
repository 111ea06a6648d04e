//! Transport-agnostic message envelope
//!
//! A [`Message`] carries everything a transport needs to route and
//! acknowledge a record without fixing its payload encoding:
//!
//! - `topic`, an optional `partition` hint and the transport `offset`
//! - opaque `key` bytes
//! - a lazily evaluated `value` ([`ValueProvider`])
//! - ordered, multi-valued [`Headers`]
//! - an optional one-shot [`Ack`] run once processing completes

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use platform_bus::{BusError, BusResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

type ValueFn = dyn Fn() -> BusResult<Vec<u8>> + Send + Sync;

/// Deferred producer of a message body.
///
/// The body is only produced when a transport or consumer asks for it, so
/// encoding cost is paid once the message is actually written or read.
#[derive(Clone, Default)]
pub struct ValueProvider(Option<Arc<ValueFn>>);

impl ValueProvider {
    /// Provider returning fixed bytes.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        let value: Arc<[u8]> = value.into().into();
        Self(Some(Arc::new(move || Ok(value.to_vec()))))
    }

    /// Provider calling `f` on every evaluation.
    pub fn lazy(f: impl Fn() -> BusResult<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// Produce the body. An empty provider yields no bytes.
    pub fn get(&self) -> BusResult<Vec<u8>> {
        match &self.0 {
            Some(f) => f(),
            None => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for ValueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "ValueProvider(..)" } else { "ValueProvider(empty)" })
    }
}

/// Ordered header list allowing repeated names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping earlier values of the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name` in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Remove every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type AckFn = dyn Fn() -> BoxFuture<'static, BusResult<()>> + Send + Sync;

struct AckInner {
    f: Arc<AckFn>,
    outcome: OnceCell<BusResult<()>>,
}

/// One-shot acknowledgment callback.
///
/// Clones share state: however many times and from however many tasks
/// [`ack`](Self::ack) is called, the callback runs once and every caller
/// sees its outcome.
#[derive(Clone)]
pub struct Ack {
    inner: Arc<AckInner>,
}

impl Ack {
    /// Wrap an async acknowledgment callback.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(AckInner {
                f: Arc::new(move || f().boxed()),
                outcome: OnceCell::new(),
            }),
        }
    }

    /// Run the callback if it has not run yet.
    pub async fn ack(&self) -> BusResult<()> {
        self.inner
            .outcome
            .get_or_init(|| (self.inner.f)())
            .await
            .clone()
    }

    /// Whether the callback has completed.
    pub fn is_acked(&self) -> bool {
        self.inner.outcome.initialized()
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Transport-agnostic message envelope.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name
    pub topic: String,

    /// Partition hint on send, source partition on receive
    pub partition: Option<i32>,

    /// Position within the partition, set by transports on receive
    pub offset: Option<i64>,

    /// Routing key
    pub key: Vec<u8>,

    /// Deferred body
    pub value: ValueProvider,

    /// Ordered headers
    pub headers: Headers,

    /// Broker timestamp
    pub timestamp: Option<DateTime<Utc>>,

    /// Acknowledgment run once processing completes
    pub ack: Option<Ack>,
}

impl Message {
    /// Create a message with a fixed body.
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::with_value(topic, ValueProvider::bytes(value))
    }

    /// Create a message whose body is produced by `provider`.
    pub fn with_value(topic: impl Into<String>, provider: ValueProvider) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
            key: Vec::new(),
            value: provider,
            headers: Headers::new(),
            timestamp: None,
            ack: None,
        }
    }

    /// Create a message whose body is `payload` encoded as JSON on demand.
    pub fn json<T>(topic: impl Into<String>, payload: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let mut message = Self::with_value(
            topic,
            ValueProvider::lazy(move || serde_json::to_vec(&payload).map_err(BusError::transform)),
        );
        message.headers.set("content-type", "application/json");
        message
    }

    /// Set the routing key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the partition hint.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach an acknowledgment.
    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Produce the body.
    pub fn value(&self) -> BusResult<Vec<u8>> {
        self.value.get()
    }

    /// Decode the body as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> BusResult<T> {
        let bytes = self.value()?;
        serde_json::from_slice(&bytes).map_err(BusError::transform)
    }

    /// Run the attached acknowledgment, if any.
    pub async fn ack(&self) -> BusResult<()> {
        match &self.ack {
            Some(ack) => ack.ack().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_value_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let message = Message::with_value(
            "orders",
            ValueProvider::lazy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"body".to_vec())
            }),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(message.value().unwrap(), b"body");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let message = Message::json(
            "orders",
            OrderPlaced {
                id: 7,
                sku: "A-1".to_string(),
            },
        );

        assert_eq!(message.headers.get("content-type"), Some("application/json"));
        let decoded: OrderPlaced = message.decode_json().unwrap();
        assert_eq!(decoded.id, 7);

        let broken = Message::new("orders", b"{not json".to_vec());
        assert!(matches!(
            broken.decode_json::<OrderPlaced>(),
            Err(BusError::Transform(_))
        ));
    }

    #[test]
    fn test_headers_keep_order_and_repeats() {
        let mut headers = Headers::new();
        headers.add("trace", "a");
        headers.add("tenant", "acme");
        headers.add("trace", "b");

        assert_eq!(headers.get("trace"), Some("a"));
        assert_eq!(headers.get_all("trace"), vec!["a", "b"]);
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![("trace", "a"), ("tenant", "acme"), ("trace", "b")]
        );

        headers.set("trace", "c");
        assert_eq!(headers.get_all("trace"), vec!["c"]);
        assert_eq!(headers.len(), 2);

        headers.remove("tenant");
        headers.remove("trace");
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn test_ack_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ack = Ack::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let message = Message::new("orders", "x").with_ack(ack.clone());

        let (a, b) = tokio::join!(message.ack(), ack.ack());
        assert!(a.is_ok() && b.is_ok());
        message.ack().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ack.is_acked());
    }

    #[tokio::test]
    async fn test_ack_failure_is_shared() {
        let ack = Ack::new(|| async { Err(BusError::transport("commit rejected")) });

        assert_eq!(ack.ack().await, Err(BusError::transport("commit rejected")));
        assert_eq!(ack.ack().await, Err(BusError::transport("commit rejected")));
    }

    #[tokio::test]
    async fn test_message_without_ack() {
        let message = Message::new("orders", "x").with_key("k").with_partition(3);
        assert!(message.ack().await.is_ok());
        assert_eq!(message.key, b"k");
        assert_eq!(message.partition, Some(3));
    }
}
