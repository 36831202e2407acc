//! Broker transport traits, the seam between the bus and a broker
//!
//! A `Transport` opens `Channel`s; a channel declares topic-exchange
//! topology (exchange, named queue, routing-key bindings), publishes, and
//! opens manual-ack `Consumer`s. Backends: in-memory and NATS JetStream.

use crate::error::Result;
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Factory for broker channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new physical connection and return its channel
    async fn connect(&self) -> Result<Arc<dyn Channel>>;

    /// Transport name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// An open session on a broker connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Whether the underlying connection is still usable
    fn is_open(&self) -> bool;

    /// Declare a topic exchange (idempotent)
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a named queue on an exchange (idempotent)
    async fn declare_queue(&self, exchange: &str, queue: &str, options: &QueueOptions)
        -> Result<()>;

    /// Route messages with `routing_key` into `queue`
    async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Stop routing `routing_key` into `queue`
    async fn unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish a message to an exchange
    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement
    async fn consume(&self, exchange: &str, queue: &str) -> Result<Box<dyn Consumer>>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Queue-level delivery settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    /// Broker-side delivery limit (None = unlimited)
    pub max_deliver: Option<i64>,

    /// In-flight unacknowledged messages allowed
    pub max_ack_pending: Option<i64>,

    /// How long the broker waits for an ack before redelivering
    pub ack_wait: Option<Duration>,
}

/// Async handle receiving deliveries from one queue
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Receive the next delivery; `Ok(None)` when the consumer is closed
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A delivery pending acknowledgement
///
/// Dropping a delivery that was neither acked nor nacked releases it back
/// to the broker through its nak callback, so it stays eligible for
/// redelivery.
pub struct Delivery {
    /// The received message
    pub message: ReceivedMessage,

    ack_fn: Option<AckFn>,
    nak_fn: Option<AckFn>,
}

impl Delivery {
    /// Create a delivery with ack/nak callbacks
    pub fn new(
        message: ReceivedMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Some(Box::new(ack_fn)),
            nak_fn: Some(Box::new(nak_fn)),
        }
    }

    /// Acknowledge: the broker forgets the message
    pub async fn ack(mut self) -> Result<()> {
        self.nak_fn = None;
        match self.ack_fn.take() {
            Some(ack) => ack().await,
            None => Ok(()),
        }
    }

    /// Negative-acknowledge: the broker redelivers the message
    pub async fn nak(mut self) -> Result<()> {
        self.ack_fn = None;
        match self.nak_fn.take() {
            Some(nak) => nak().await,
            None => Ok(()),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(nak) = self.nak_fn.take() else {
            return;
        };
        let sequence = self.message.sequence;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(sequence, "Delivery dropped unsettled, releasing for redelivery");
                runtime.spawn(async move {
                    if let Err(e) = nak().await {
                        tracing::warn!(sequence, error = %e, "Failed to release dropped delivery");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(sequence, "Delivery dropped unsettled outside a runtime");
            }
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
