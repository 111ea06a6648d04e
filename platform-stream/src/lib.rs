//! # Platform Stream
//!
//! This crate binds the [`platform_bus`] subscriber contracts to partitioned,
//! offset-committing message brokers.
//!
//! ## Overview
//!
//! The platform-stream crate handles:
//! - **Messages**: [`Message`] with lazy bodies, ordered headers and one-shot acks
//! - **Producing**: the [`Producer`] contract and [`ProducerSubscriber`]
//! - **Consuming**: the [`Transport`] contract, [`Poller`]/[`DemandPoller`] and [`TransportConsumer`]
//! - **Middlewares**: acknowledgment, panic recovery, topic prefixing, JSON decoding
//! - **Testing**: [`MemoryBroker`], an in-process broker with consumer groups
//!
//! ## Flow control
//!
//! With `respect_demand` enabled the consumer asks its subscriber for demand
//! before every poll. At zero demand the transport's partitions are paused;
//! they resume as soon as the subscriber reports room again. Pair this with an
//! [`platform_bus::AsyncDemandingSubscriber`] to process in the background
//! without unbounded buffering.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use platform_bus::{AsyncDemandingSubscriber, Publisher, SharedSubscriber};
//! use platform_stream::{decode_json, Consumer, ConsumerConfig, MemoryBroker, Message, TransportConsumer};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! async fn consume(handler: SharedSubscriber<OrderPlaced>) -> Result<(), platform_bus::BusError> {
//!     let broker = MemoryBroker::new();
//!     let consumer = TransportConsumer::new(
//!         Arc::new(broker.transport("billing")),
//!         ConsumerConfig::for_topics(["orders"]),
//!     )?;
//!
//!     let decoded: SharedSubscriber<Message> = Arc::new(decode_json(handler));
//!     let worker = Arc::new(AsyncDemandingSubscriber::new(decoded, 64, None));
//!     consumer.subscribe(worker.clone()).await?;
//!
//!     // ...
//!
//!     consumer.close().await?;
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod memory;
pub mod message;
pub mod middleware;
pub mod poller;
pub mod producer;
pub mod topic;
pub mod transport;

// Re-export main types
pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{Consumer, TransportConsumer};
pub use memory::{MemoryBroker, MemoryProducer, MemoryTransport};
pub use message::{Ack, Headers, Message, ValueProvider};
pub use middleware::{decode_json, AckMiddleware, DecodeSubscriber, RecoverMiddleware};
pub use poller::{run_poll_loop, DemandPoller, Pollable, Poller};
pub use producer::{send_sync_until, Producer, ProducerSubscriber, SharedProducer};
pub use topic::TopicPrefix;
pub use transport::{Partition, SharedTransport, Transport, TransportError, TransportEvent};
