//! Low-level consumer transport contract
//!
//! A [`Transport`] is the part of a broker client the polling loop drives:
//! group subscription, a bounded-wait poll returning one [`TransportEvent`],
//! partition assignment bookkeeping, pause/resume and offset commits.
//! Broker clients implement it; [`crate::memory::MemoryTransport`] is the
//! in-process implementation.

use async_trait::async_trait;
use platform_bus::BusResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// A single partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    /// Topic name
    pub topic: String,
    /// Partition index within the topic
    pub partition: i32,
}

impl Partition {
    /// Create a partition reference.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Error reported by a transport poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// The transport cannot continue
    pub fatal: bool,
    /// Human-readable description
    pub message: String,
}

impl TransportError {
    /// Recoverable error; polling continues.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            message: message.into(),
        }
    }

    /// Unrecoverable error; polling stops.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of one transport poll.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A record ready for delivery
    Message(Message),
    /// The group handed these partitions to this member
    Assigned(Vec<Partition>),
    /// The group took these partitions away
    Revoked(Vec<Partition>),
    /// A transport-level error
    Error(TransportError),
}

/// Consumer side of a broker client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the consumer group for `topics`.
    async fn subscribe(&self, topics: &[String]) -> BusResult<()>;

    /// Leave the consumer group.
    async fn unsubscribe(&self) -> BusResult<()>;

    /// Wait up to `timeout` for the next event.
    async fn poll(&self, timeout: Duration) -> Option<TransportEvent>;

    /// Partitions currently assigned to this member.
    fn assignment(&self) -> BusResult<Vec<Partition>>;

    /// Start fetching from `partitions`.
    fn assign(&self, partitions: &[Partition]) -> BusResult<()>;

    /// Stop fetching from `partitions`.
    fn unassign(&self, partitions: &[Partition]) -> BusResult<()>;

    /// Suspend fetching from `partitions` without leaving the group.
    fn pause(&self, partitions: &[Partition]) -> BusResult<()>;

    /// Resume fetching from `partitions`.
    fn resume(&self, partitions: &[Partition]) -> BusResult<()>;

    /// Record `offset` on `partition` as processed.
    async fn commit(&self, partition: &Partition, offset: i64) -> BusResult<()>;

    /// Release the client.
    async fn close(&self) -> BusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display_and_order() {
        let a = Partition::new("orders", 0);
        let b = Partition::new("orders", 1);

        assert_eq!(a.to_string(), "orders[0]");
        assert!(a < b);
    }

    #[test]
    fn test_transport_error_kinds() {
        assert!(TransportError::fatal("broker gone").fatal);
        assert!(!TransportError::transient("leader moved").fatal);
        assert_eq!(TransportError::transient("leader moved").to_string(), "leader moved");
    }
}
