//! Dead letter queue: messages the bus gave up on
//!
//! Two kinds end up here: poison messages (malformed payload or a terminal
//! handler error, acked once and never retried) and messages whose
//! delivery count reached `max_redeliveries` while still failing
//! transiently. Routing lives above the transport, so the same handlers
//! work for every backend.

use crate::connection::BrokerConnection;
use crate::error::Result;
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Routing-key prefix for republished dead letters
pub const DEAD_LETTER_PREFIX: &str = "dead-letter";

/// Why a message was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Undecodable payload or non-retryable handler failure
    Poison(String),

    /// Transient failures outlasted the redelivery budget
    MaxRedeliveries { deliveries: u64, last_error: String },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Poison(reason) => write!(f, "poison: {}", reason),
            DeadLetterReason::MaxRedeliveries {
                deliveries,
                last_error,
            } => write!(f, "gave up after {} deliveries: {}", deliveries, last_error),
        }
    }
}

/// A failed message with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The message as it was delivered
    pub message: ReceivedMessage,

    pub reason: DeadLetterReason,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(message: ReceivedMessage, reason: DeadLetterReason) -> Self {
        Self {
            message,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn is_poison(&self) -> bool {
        matches!(self.reason, DeadLetterReason::Poison(_))
    }
}

/// Trait for dead letter queue handlers
///
/// Implementations decide what to do with messages the bus will no
/// longer retry: log, store, forward, or alert.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered message
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// Get the number of messages currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// List recent dead-lettered messages, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// In-memory DLQ handler for development and testing
///
/// Stores dead-lettered messages in a `Vec` with configurable max capacity.
pub struct MemoryDlqHandler {
    events: Arc<RwLock<Vec<DeadLetterEvent>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::warn!(
            routing_key = %event.message.routing_key,
            message_id = ?event.message.message_id,
            delivery_count = event.message.delivery_count,
            reason = %event.reason,
            "Message dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Republishes dead letters to `<exchange>` under `dead-letter.<routing key>`
///
/// Keeps a local log as well, so `count`/`list` work without reading the
/// broker back.
pub struct BrokerDlqHandler {
    connection: Arc<BrokerConnection>,
    exchange: String,
    log: MemoryDlqHandler,
}

impl BrokerDlqHandler {
    pub fn new(connection: Arc<BrokerConnection>, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            log: MemoryDlqHandler::default(),
        }
    }
}

/// Routing key a dead letter is republished under
pub fn dead_letter_routing_key(routing_key: &str) -> String {
    format!("{}.{}", DEAD_LETTER_PREFIX, routing_key)
}

#[async_trait]
impl DlqHandler for BrokerDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        let message = OutgoingMessage {
            routing_key: dead_letter_routing_key(&event.message.routing_key),
            message_id: event
                .message
                .message_id
                .clone()
                .unwrap_or_else(|| format!("seq-{}", event.message.sequence)),
            body: event.message.body.clone(),
            persistent: true,
        };

        let channel = self.connection.ensure_connected().await?;
        if let Err(e) = channel.publish(&self.exchange, message).await {
            self.connection.mark_down(&channel, &e.to_string()).await;
            return Err(e);
        }

        self.log.handle(event).await
    }

    async fn count(&self) -> Result<usize> {
        self.log.count().await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        self.log.list(limit).await
    }
}

/// Check whether a message reached its delivery budget
///
/// `max_redeliveries == 0` means unlimited.
pub fn should_dead_letter(message: &ReceivedMessage, max_redeliveries: u64) -> bool {
    max_redeliveries > 0 && message.delivery_count >= max_redeliveries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::transport::memory::{MemoryBroker, MemoryTransport};
    use crate::transport::QueueOptions;
    use bytes::Bytes;

    fn received(delivery_count: u64) -> ReceivedMessage {
        ReceivedMessage {
            routing_key: "OrderStarted".to_string(),
            body: Bytes::from_static(b"{}"),
            message_id: Some("m-1".to_string()),
            delivery_count,
            sequence: 1,
        }
    }

    #[test]
    fn test_should_dead_letter() {
        assert!(!should_dead_letter(&received(1), 5));
        assert!(!should_dead_letter(&received(4), 5));
        assert!(should_dead_letter(&received(5), 5));
        assert!(should_dead_letter(&received(10), 5));
    }

    #[test]
    fn test_should_dead_letter_zero_max() {
        assert!(!should_dead_letter(&received(100), 0));
    }

    #[test]
    fn test_reason_display() {
        let reason = DeadLetterReason::MaxRedeliveries {
            deliveries: 10,
            last_error: "timeout".into(),
        };
        assert_eq!(reason.to_string(), "gave up after 10 deliveries: timeout");
        assert!(DeadLetterEvent::new(received(1), DeadLetterReason::Poison("bad".into())).is_poison());
    }

    #[tokio::test]
    async fn test_memory_dlq_list_newest_first() {
        let dlq = MemoryDlqHandler::default();
        for i in 0..5 {
            let mut message = received(3);
            message.sequence = i;
            dlq.handle(DeadLetterEvent::new(
                message,
                DeadLetterReason::Poison(format!("reason {}", i)),
            ))
            .await
            .unwrap();
        }

        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].message.sequence, 4);
        assert_eq!(list[2].message.sequence, 2);
    }

    #[tokio::test]
    async fn test_memory_dlq_max_capacity() {
        let dlq = MemoryDlqHandler::new(3);
        for i in 0..5 {
            let mut message = received(1);
            message.sequence = i;
            dlq.handle(DeadLetterEvent::new(message, DeadLetterReason::Poison("x".into())))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].message.sequence, 4);
        assert_eq!(list[2].message.sequence, 2);
    }

    #[tokio::test]
    async fn test_broker_dlq_republishes() {
        let broker = MemoryBroker::new();
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(MemoryTransport::with_broker(broker.clone())),
            RetryPolicy::new(),
        ));
        let channel = connection.ensure_connected().await.unwrap();
        channel.declare_exchange("eshop_event_bus").await.unwrap();
        channel
            .declare_queue("eshop_event_bus", "ops", &QueueOptions::default())
            .await
            .unwrap();
        channel
            .bind("eshop_event_bus", "ops", "dead-letter.#")
            .await
            .unwrap();

        let dlq = BrokerDlqHandler::new(connection, "eshop_event_bus");
        dlq.handle(DeadLetterEvent::new(
            received(10),
            DeadLetterReason::MaxRedeliveries {
                deliveries: 10,
                last_error: "timeout".into(),
            },
        ))
        .await
        .unwrap();

        assert_eq!(dlq.count().await.unwrap(), 1);
        assert_eq!(broker.queue_depth("ops"), 1);
        assert_eq!(broker.published()[0].routing_key, "dead-letter.OrderStarted");
    }
}
