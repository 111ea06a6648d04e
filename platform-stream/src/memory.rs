//! In-memory broker for testing and single-process deployments.
//!
//! [`MemoryBroker`] keeps an append-only log per topic (one partition each)
//! and the committed offsets of every consumer group. It hands out:
//!
//! - [`MemoryProducer`]s appending to the logs
//! - [`MemoryTransport`]s reading them as members of a consumer group
//!
//! A transport announces its partitions with an `Assigned` event on the first
//! poll after `subscribe`, and starts each partition at the group's committed
//! offset. Pause and resume calls are counted so flow control can be observed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use platform_stream::{Message, MemoryBroker, Producer, Transport};
//! use std::time::Duration;
//!
//! async fn example() {
//!     let broker = MemoryBroker::new();
//!     broker.producer().send(Message::new("orders", "created")).await.unwrap();
//!
//!     let transport = broker.transport("billing");
//!     transport.subscribe(&["orders".to_string()]).await.unwrap();
//!     let assigned = transport.poll(Duration::from_millis(10)).await;
//!     println!("{assigned:?}");
//! }
//! ```

use crate::message::{Headers, Message, ValueProvider};
use crate::producer::Producer;
use crate::transport::{Partition, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use platform_bus::{BusError, BusResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Every topic has exactly this one partition.
const PARTITION: i32 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Record {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Headers,
    timestamp: DateTime<Utc>,
}

impl Record {
    fn to_message(&self, partition: &Partition, offset: i64) -> Message {
        Message {
            topic: partition.topic.clone(),
            partition: Some(partition.partition),
            offset: Some(offset),
            key: self.key.clone(),
            value: ValueProvider::bytes(self.value.clone()),
            headers: self.headers.clone(),
            timestamp: Some(self.timestamp),
            ack: None,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    logs: Mutex<HashMap<String, Vec<Record>>>,
    /// Next offset to read, per (group, partition)
    committed: Mutex<HashMap<(String, Partition), i64>>,
    changed: Notify,
}

/// In-process broker shared by producers and transports.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer appending to this broker.
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Transport joining consumer group `group`.
    pub fn transport(&self, group: impl Into<String>) -> MemoryTransport {
        let transport = MemoryTransport {
            broker: self.clone(),
            group: group.into(),
            member_id: Uuid::now_v7(),
            state: Mutex::new(MemberState::default()),
            pause_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
        };
        tracing::debug!(group = %transport.group, member_id = %transport.member_id, "Created memory transport");
        transport
    }

    /// Append `message` to its topic log and return its offset.
    ///
    /// The message body is evaluated here.
    pub fn append(&self, message: &Message) -> BusResult<i64> {
        if message.topic.is_empty() {
            return Err(BusError::delivery("message has no topic"));
        }

        let record = Record {
            key: message.key.clone(),
            value: message.value()?,
            headers: message.headers.clone(),
            timestamp: message.timestamp.unwrap_or_else(Utc::now),
        };

        let offset = {
            let mut logs = lock(&self.state.logs);
            let log = logs.entry(message.topic.clone()).or_default();
            log.push(record);
            (log.len() - 1) as i64
        };

        self.state.changed.notify_waiters();
        Ok(offset)
    }

    /// Number of records in `topic`.
    pub fn len(&self, topic: &str) -> usize {
        lock(&self.state.logs).get(topic).map_or(0, Vec::len)
    }

    /// Whether `topic` has no records.
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Every record of `topic` in offset order.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let partition = Partition::new(topic, PARTITION);
        lock(&self.state.logs)
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, record)| record.to_message(&partition, offset as i64))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset group `group` will read from `partition`.
    pub fn committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        lock(&self.state.committed)
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    fn commit(&self, group: &str, partition: &Partition, offset: i64) {
        lock(&self.state.committed).insert((group.to_string(), partition.clone()), offset + 1);
    }
}

/// Producer writing into a [`MemoryBroker`].
pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn write(&self, message: &Message) -> BusResult<i64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let offset = self.broker.append(message)?;
        tracing::debug!(topic = %message.topic, offset, "Produced message");
        Ok(offset)
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: Message) -> BusResult<()> {
        self.write(&message).map(|_| ())
    }

    async fn send_sync(&self, message: Message) -> BusResult<()> {
        self.write(&message).map(|_| ())
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MemberState {
    topics: Vec<String>,
    assign_pending: bool,
    assignment: Vec<Partition>,
    positions: HashMap<Partition, i64>,
    paused: HashSet<Partition>,
    injected: VecDeque<TransportEvent>,
    closed: bool,
}

/// Consumer group member reading from a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    group: String,
    member_id: Uuid,
    state: Mutex<MemberState>,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
}

impl MemoryTransport {
    /// Consumer group this member belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Unique id of this group member.
    pub fn member_id(&self) -> Uuid {
        self.member_id
    }

    /// Number of `pause` calls so far.
    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    /// Number of `resume` calls so far.
    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Currently paused partitions, sorted.
    pub fn paused(&self) -> Vec<Partition> {
        let mut paused: Vec<_> = lock(&self.state).paused.iter().cloned().collect();
        paused.sort();
        paused
    }

    /// Queue `event` ahead of any log record for the next poll.
    pub fn inject(&self, event: TransportEvent) {
        lock(&self.state).injected.push_back(event);
        self.broker.state.changed.notify_waiters();
    }

    fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if state.closed {
            return Some(TransportEvent::Error(TransportError::fatal("transport closed")));
        }
        if let Some(event) = state.injected.pop_front() {
            return Some(event);
        }
        if state.assign_pending {
            state.assign_pending = false;
            let partitions = state
                .topics
                .iter()
                .map(|topic| Partition::new(topic.clone(), PARTITION))
                .collect();
            return Some(TransportEvent::Assigned(partitions));
        }

        let logs = lock(&self.broker.state.logs);
        for partition in &state.assignment {
            if state.paused.contains(partition) {
                continue;
            }
            let position = state.positions.get(partition).copied().unwrap_or(0);
            let record = logs
                .get(&partition.topic)
                .and_then(|log| log.get(position as usize));
            if let Some(record) = record {
                state.positions.insert(partition.clone(), position + 1);
                return Some(TransportEvent::Message(record.to_message(partition, position)));
            }
        }
        None
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        if topics.is_empty() {
            return Err(BusError::Subscribe("no topics given".to_string()));
        }
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BusError::Closed);
            }
            state.topics = topics.to_vec();
            state.assign_pending = true;
        }

        tracing::info!(group = %self.group, member_id = %self.member_id, topics = ?topics, "Joined consumer group");
        self.broker.state.changed.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        let mut state = lock(&self.state);
        state.topics.clear();
        state.assign_pending = false;
        state.assignment.clear();
        state.positions.clear();
        state.paused.clear();
        tracing::info!(group = %self.group, member_id = %self.member_id, "Left consumer group");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Option<TransportEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before checking so an append in between still wakes us.
            let changed = self.broker.state.changed.notified();
            if let Some(event) = self.next_event() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }

    fn assignment(&self) -> BusResult<Vec<Partition>> {
        Ok(lock(&self.state).assignment.clone())
    }

    fn assign(&self, partitions: &[Partition]) -> BusResult<()> {
        let mut state = lock(&self.state);
        for partition in partitions {
            if !state.assignment.contains(partition) {
                state.assignment.push(partition.clone());
            }
            let start = self.broker.committed(&self.group, partition).unwrap_or(0);
            state.positions.entry(partition.clone()).or_insert(start);
        }
        Ok(())
    }

    fn unassign(&self, partitions: &[Partition]) -> BusResult<()> {
        let mut state = lock(&self.state);
        state.assignment.retain(|p| !partitions.contains(p));
        for partition in partitions {
            state.positions.remove(partition);
            state.paused.remove(partition);
        }
        Ok(())
    }

    fn pause(&self, partitions: &[Partition]) -> BusResult<()> {
        let mut state = lock(&self.state);
        if let Some(missing) = partitions.iter().find(|p| !state.assignment.contains(p)) {
            return Err(BusError::transport(format!("partition {missing} is not assigned")));
        }
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> BusResult<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            for partition in partitions {
                state.paused.remove(partition);
            }
        }
        self.broker.state.changed.notify_waiters();
        Ok(())
    }

    async fn commit(&self, partition: &Partition, offset: i64) -> BusResult<()> {
        self.broker.commit(&self.group, partition, offset);
        tracing::debug!(group = %self.group, partition = %partition, offset, "Committed offset");
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        lock(&self.state).closed = true;
        self.broker.state.changed.notify_waiters();
        Ok(())
    }
}
