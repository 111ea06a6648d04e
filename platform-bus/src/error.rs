//! Error types for bus operations
//!
//! Every fallible bus operation returns [`BusResult`]. Synchronous paths
//! (notify, fan-out, middleware chains) hand the first error straight back to
//! the caller; asynchronous paths report through error callbacks instead.

use thiserror::Error;

/// Bus error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A subscriber failed to accept or process events
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Mapping an event between representations failed
    #[error("Transform failed: {0}")]
    Transform(String),

    /// Registering a subscriber failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    /// The underlying message transport reported an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Subscriber code panicked while handling events
    #[error("Subscriber panicked: {0}")]
    Panicked(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component has been closed
    #[error("Closed")]
    Closed,

    /// The operation was canceled before it completed
    #[error("Canceled")]
    Canceled,
}

impl BusError {
    /// Wrap any displayable error as a delivery failure.
    pub fn delivery(err: impl std::fmt::Display) -> Self {
        Self::Delivery(err.to_string())
    }

    /// Wrap any displayable error as a transform failure.
    pub fn transform(err: impl std::fmt::Display) -> Self {
        Self::Transform(err.to_string())
    }

    /// Wrap any displayable error as a transport failure.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Build a [`BusError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::Panicked(message)
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
