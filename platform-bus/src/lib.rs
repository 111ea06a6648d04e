//! # Platform Bus
//!
//! This crate provides the in-process publish/subscribe core for the Relay
//! platform: a small set of subscriber contracts with a cooperative
//! flow-control signal, combinators to compose them, and a topic-keyed bus.
//!
//! ## Overview
//!
//! The platform-bus crate handles:
//! - **Contracts**: [`Subscriber`] (publish + demand) and [`Publisher`] (subscribe)
//! - **Combinators**: type mapping, demand overrides, middleware chains, fan-out
//! - **Async delivery**: [`AsyncDemandingSubscriber`], a bounded queue with a live demand signal
//! - **Event bus**: [`SyncEventBus`] and the type-adapting [`EventBusAdapter`]
//!
//! ## Demand
//!
//! Every subscriber reports how many more events it is willing to take right
//! now. `0` asks upstream producers to hold back; [`UNBOUNDED`] means no bound.
//! Transport bridges (see the `platform-stream` crate) pause their intake while
//! demand is zero instead of buffering without limit.
//!
//! ## Usage
//!
//! ### Notifying subscribers
//!
//! ```rust,no_run
//! use platform_bus::{EventBus, SubscriberFn, SyncEventBus};
//! use std::sync::Arc;
//!
//! async fn notify_example() {
//!     let bus = SyncEventBus::<String>::new();
//!
//!     let printer = SubscriberFn::new(|events: Vec<String>| async move {
//!         println!("received {events:?}");
//!         Ok(())
//!     });
//!     bus.subscribe("orders", Arc::new(printer)).await.unwrap();
//!
//!     bus.notify("orders", vec!["created".to_string()]).await.unwrap();
//! }
//! ```
//!
//! ### Processing in the background
//!
//! ```rust,no_run
//! use platform_bus::{
//!     AsyncDemandingSubscriber, EventBus, SharedSubscriber, Subscriber, SubscriberFn, SyncEventBus,
//! };
//! use std::sync::Arc;
//!
//! async fn async_example() {
//!     let bus = SyncEventBus::<String>::new();
//!
//!     let slow: SharedSubscriber<String> = Arc::new(SubscriberFn::new(|events: Vec<String>| async move {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!         println!("processed {events:?}");
//!         Ok(())
//!     }));
//!     let worker = Arc::new(AsyncDemandingSubscriber::new(slow, 100, None));
//!
//!     bus.subscribe("orders", worker.clone()).await.unwrap();
//!     bus.notify("orders", vec!["created".to_string()]).await.unwrap();
//!
//!     println!("room for {} more", worker.demand());
//!     worker.shutdown().await;
//! }
//! ```

pub mod adapter;
pub mod bus;
pub mod combinators;
pub mod demanding;
pub mod error;
pub mod subscriber;

// Re-export main types
pub use adapter::EventBusAdapter;
pub use bus::{EventBus, EventBusStats, SharedEventBus, SyncEventBus, TopicPublisher, TopicSubscriber};
pub use combinators::{
    subscribe_all, subscriber_with, Interception, MapSubscriber, Middleware, MiddlewareFn,
    SharedMiddleware, SubscribeAll, WithDemand,
};
pub use demanding::{AsyncDemandingSubscriber, ErrorCallback};
pub use error::{BusError, BusResult};
pub use subscriber::{Publisher, PublisherFn, SharedSubscriber, Subscriber, SubscriberFn, UNBOUNDED};
