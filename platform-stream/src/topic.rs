//! Topic namespacing
//!
//! Deployments sharing one broker keep their topics apart with a prefix
//! (`staging.orders`, `prod.orders`). [`TopicPrefix`] adds the prefix on the
//! way out and strips it on the way in, and exposes both directions as
//! middleware so producers and consumers stay prefix-unaware.

use crate::message::Message;
use async_trait::async_trait;
use platform_bus::{BusResult, Middleware, SharedMiddleware, SharedSubscriber};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SEPARATOR: char = '.';

/// Prefix joined to topic names with a `.`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPrefix(String);

impl TopicPrefix {
    /// Create a prefix. An empty prefix leaves topics untouched.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// The raw prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no prefix is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Qualify `topic`. An empty prefix or topic is returned unchanged.
    pub fn apply(&self, topic: &str) -> String {
        if self.0.is_empty() || topic.is_empty() {
            return topic.to_string();
        }
        format!("{}{}{}", self.0, SEPARATOR, topic)
    }

    /// Remove the prefix from `topic`. Topics outside the prefix are returned unchanged.
    pub fn strip<'a>(&self, topic: &'a str) -> &'a str {
        if self.0.is_empty() {
            return topic;
        }
        topic
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(topic)
    }

    /// Middleware qualifying the topic of every outgoing message.
    pub fn outbound(&self) -> SharedMiddleware<Message> {
        Arc::new(PrefixMiddleware {
            prefix: self.clone(),
            direction: Direction::Outbound,
        })
    }

    /// Middleware stripping the prefix from every incoming message.
    pub fn inbound(&self) -> SharedMiddleware<Message> {
        Arc::new(PrefixMiddleware {
            prefix: self.clone(),
            direction: Direction::Inbound,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}

struct PrefixMiddleware {
    prefix: TopicPrefix,
    direction: Direction,
}

#[async_trait]
impl Middleware<Message> for PrefixMiddleware {
    async fn call(&self, mut events: Vec<Message>, next: SharedSubscriber<Message>) -> BusResult<()> {
        if !self.prefix.is_empty() {
            for message in &mut events {
                message.topic = match self.direction {
                    Direction::Outbound => self.prefix.apply(&message.topic),
                    Direction::Inbound => self.prefix.strip(&message.topic).to_string(),
                };
            }
        }
        next.publish(events).await
    }
}
