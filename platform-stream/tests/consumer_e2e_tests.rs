//! End-to-End tests for the broker-backed consumer pipeline.
//!
//! These tests run producers and consumers against the in-memory broker and
//! verify delivery, acknowledgment and flow control across the whole stack.
//!
//! Scenarios:
//! 1. JSON messages decoded and handled, offsets committed
//! 2. Slow background subscriber pauses and resumes the transport
//! 3. Panicking handler recovered, with and without commit
//! 4. Failing handler stops the consumer; the group redelivers
//! 5. Bus events produced through a prefixed producer subscriber

use platform_bus::{
    subscriber_with, AsyncDemandingSubscriber, BusError, ErrorCallback, EventBus, Publisher,
    SharedSubscriber, SubscriberFn, SyncEventBus,
};
use platform_stream::{
    decode_json, Consumer, ConsumerConfig, MemoryBroker, MemoryTransport, Message, Partition, Producer,
    ProducerSubscriber, TopicPrefix, TransportConsumer,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
}

/// Test fixture providing a broker and a consumer group member.
struct TestFixture {
    /// Shared in-memory broker.
    broker: MemoryBroker,
    /// Transport used by the consumer under test.
    transport: Arc<MemoryTransport>,
}

impl TestFixture {
    fn new(group: &str) -> Self {
        let broker = MemoryBroker::new();
        let transport = Arc::new(broker.transport(group));
        Self { broker, transport }
    }

    fn consumer(&self, config: ConsumerConfig) -> TransportConsumer {
        TransportConsumer::new(self.transport.clone(), config).expect("valid config")
    }

    fn committed(&self, topic: &str) -> Option<i64> {
        self.broker
            .committed(self.transport.group(), &Partition::new(topic, 0))
    }

    async fn produce(&self, messages: Vec<Message>) {
        let producer = self.broker.producer();
        for message in messages {
            producer.send_sync(message).await.expect("produce");
        }
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout_ms: 5,
        ..ConsumerConfig::for_topics(["orders"])
    }
}

fn recording<E: Send + 'static>(out: &Arc<Mutex<Vec<E>>>) -> SharedSubscriber<E> {
    let out = out.clone();
    Arc::new(SubscriberFn::new(move |events: Vec<E>| {
        let out = out.clone();
        async move {
            out.lock().unwrap().extend(events);
            Ok(())
        }
    }))
}

fn bodies(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(&m.value().unwrap()).into_owned())
        .collect()
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_stopped(consumer: &TransportConsumer) {
    for _ in 0..400 {
        if !consumer.is_running().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for consumer to stop");
}

#[tokio::test]
async fn test_decoded_messages_are_handled_and_committed() {
    let fixture = TestFixture::new("billing");
    let consumer = fixture.consumer(config());

    let orders = Arc::new(Mutex::new(Vec::<OrderPlaced>::new()));
    let decoded: SharedSubscriber<Message> = Arc::new(decode_json(recording(&orders)));
    consumer.subscribe(decoded).await.unwrap();

    fixture
        .produce((1..=3).map(|id| Message::json("orders", OrderPlaced { id })).collect())
        .await;

    wait_until("three commits", || fixture.committed("orders") == Some(3)).await;
    consumer.close().await.unwrap();

    assert_eq!(
        *orders.lock().unwrap(),
        vec![OrderPlaced { id: 1 }, OrderPlaced { id: 2 }, OrderPlaced { id: 3 }]
    );
}

#[tokio::test]
async fn test_slow_subscriber_pauses_transport() {
    let fixture = TestFixture::new("billing");
    let consumer = fixture.consumer(config());

    let gate = Arc::new(Semaphore::new(0));
    let processed = Arc::new(Mutex::new(Vec::new()));
    let slow: SharedSubscriber<Message> = {
        let gate = gate.clone();
        let processed = processed.clone();
        Arc::new(SubscriberFn::new(move |events: Vec<Message>| {
            let gate = gate.clone();
            let processed = processed.clone();
            async move {
                gate.acquire().await.unwrap().forget();
                processed.lock().unwrap().extend(bodies(&events));
                Ok(())
            }
        }))
    };
    let worker = Arc::new(AsyncDemandingSubscriber::new(slow, 2, None));
    consumer.subscribe(worker.clone()).await.unwrap();

    fixture
        .produce((0..10).map(|i| Message::new("orders", i.to_string())).collect())
        .await;

    wait_until("transport paused", || !fixture.transport.paused().is_empty()).await;
    assert_eq!(fixture.committed("orders"), Some(2));
    assert!(processed.lock().unwrap().is_empty());
    assert_eq!(fixture.transport.pause_calls(), 1);

    gate.add_permits(10);
    wait_until("all processed", || processed.lock().unwrap().len() == 10).await;

    consumer.close().await.unwrap();
    worker.shutdown().await;

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(*processed.lock().unwrap(), expected);
    assert!(fixture.transport.resume_calls() >= 1);
}

#[tokio::test]
async fn test_ignoring_demand_never_pauses() {
    let fixture = TestFixture::new("billing");
    let consumer = fixture.consumer(ConsumerConfig {
        respect_demand: false,
        ..config()
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let saturated: SharedSubscriber<Message> =
        Arc::new(platform_bus::WithDemand::new(recording(&received), || 0));
    consumer.subscribe(saturated).await.unwrap();

    fixture
        .produce(vec![Message::new("orders", "a"), Message::new("orders", "b")])
        .await;

    wait_until("both received", || received.lock().unwrap().len() == 2).await;
    consumer.close().await.unwrap();

    assert_eq!(fixture.transport.pause_calls(), 0);
}

fn panicking_on(poison: &'static str, handled: &Arc<Mutex<Vec<String>>>) -> SharedSubscriber<Message> {
    let handled = handled.clone();
    Arc::new(SubscriberFn::new(move |events: Vec<Message>| {
        let handled = handled.clone();
        async move {
            for body in bodies(&events) {
                if body == poison {
                    panic!("cannot handle {body}");
                }
                handled.lock().unwrap().push(body);
            }
            Ok(())
        }
    }))
}

fn collect_errors(errors: &Arc<Mutex<Vec<BusError>>>) -> ErrorCallback {
    let errors = errors.clone();
    Arc::new(move |err: BusError| errors.lock().unwrap().push(err))
}

#[tokio::test]
async fn test_panicking_handler_is_recovered_and_committed() {
    let fixture = TestFixture::new("billing");
    let errors = Arc::new(Mutex::new(Vec::new()));
    let consumer = fixture
        .consumer(config())
        .with_error_callback(collect_errors(&errors));

    let handled = Arc::new(Mutex::new(Vec::new()));
    consumer
        .subscribe(panicking_on("poison", &handled))
        .await
        .unwrap();

    fixture
        .produce(vec![
            Message::new("orders", "a"),
            Message::new("orders", "poison"),
            Message::new("orders", "b"),
        ])
        .await;

    wait_until("three commits", || fixture.committed("orders") == Some(3)).await;
    consumer.close().await.unwrap();

    assert_eq!(*handled.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(
        *errors.lock().unwrap(),
        vec![BusError::Panicked("cannot handle poison".to_string())]
    );
}

#[tokio::test]
async fn test_panicking_handler_without_commit() {
    let fixture = TestFixture::new("billing");
    let errors = Arc::new(Mutex::new(Vec::new()));
    let consumer = fixture
        .consumer(ConsumerConfig {
            commit_on_panic: false,
            ..config()
        })
        .with_error_callback(collect_errors(&errors));

    let handled = Arc::new(Mutex::new(Vec::new()));
    consumer
        .subscribe(panicking_on("poison", &handled))
        .await
        .unwrap();

    fixture
        .produce(vec![Message::new("orders", "a"), Message::new("orders", "poison")])
        .await;

    wait_until("panic reported", || !errors.lock().unwrap().is_empty()).await;
    consumer.close().await.unwrap();

    assert_eq!(*handled.lock().unwrap(), vec!["a"]);
    assert_eq!(fixture.committed("orders"), Some(1));
}

#[tokio::test]
async fn test_failed_handler_stops_consumer_and_group_redelivers() {
    let fixture = TestFixture::new("billing");
    let consumer = fixture.consumer(config());

    let failing: SharedSubscriber<Message> = Arc::new(SubscriberFn::new(|events: Vec<Message>| async move {
        if bodies(&events).iter().any(|b| b == "bad") {
            return Err(BusError::delivery("downstream unavailable"));
        }
        Ok(())
    }));
    consumer.subscribe(failing).await.unwrap();

    fixture
        .produce(vec![
            Message::new("orders", "ok"),
            Message::new("orders", "bad"),
            Message::new("orders", "later"),
        ])
        .await;

    wait_stopped(&consumer).await;
    assert_eq!(fixture.committed("orders"), Some(1));
    assert_eq!(
        consumer.close().await,
        Err(BusError::delivery("downstream unavailable"))
    );

    // A new member of the same group starts at the failed message.
    let retry_transport = Arc::new(fixture.broker.transport("billing"));
    let retry = TransportConsumer::new(retry_transport, config()).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    retry.subscribe(recording(&received)).await.unwrap();

    wait_until("redelivery committed", || fixture.committed("orders") == Some(3)).await;
    retry.close().await.unwrap();

    assert_eq!(bodies(&received.lock().unwrap()), vec!["bad", "later"]);
    assert_eq!(fixture.committed("orders"), Some(3));
}

#[tokio::test]
async fn test_bus_events_are_produced_with_prefix() {
    let broker = MemoryBroker::new();
    let bus: SyncEventBus<Message> = SyncEventBus::new();

    let prefix = TopicPrefix::new("staging");
    let sink: SharedSubscriber<Message> = Arc::new(ProducerSubscriber::new(Arc::new(broker.producer())));
    let writer = subscriber_with(sink, vec![prefix.outbound()]);
    bus.subscribe("outbox", writer).await.unwrap();

    bus.notify("outbox", vec![Message::json("orders", OrderPlaced { id: 9 })])
        .await
        .unwrap();

    let stored = broker.messages("staging.orders");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].decode_json::<OrderPlaced>().unwrap(), OrderPlaced { id: 9 });
    assert_eq!(stored[0].headers.get("content-type"), Some("application/json"));
    assert!(broker.is_empty("orders"));
}
