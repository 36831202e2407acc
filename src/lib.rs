//! # eshop-event-bus
//!
//! Integration event bus for eShop services, with a transactional outbox
//! and idempotent command dispatch.
//!
//! ## Overview
//!
//! Services publish *integration events* (facts about completed local
//! changes) and react to events from other services. Delivery is
//! at-least-once; handlers are expected to be idempotent, and the
//! [`IdempotencyGuard`] makes command side effects happen at most once per
//! request id.
//!
//! ## Quick Start
//!
//! ```rust
//! use eshop_event_bus::{
//!     BrokerConnection, BusConfig, EventBus, EventOutbox, EventPayload, IntegrationEvent,
//!     MemoryStore, MemoryTransport, OutboxPublisher, Transaction, TransactionalStore,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct OrderStartedIntegrationEvent {
//!     user_id: String,
//! }
//!
//! impl EventPayload for OrderStartedIntegrationEvent {
//!     const NAME: &'static str = "OrderStarted";
//! }
//!
//! # async fn example() -> eshop_event_bus::Result<()> {
//! let config = BusConfig::default();
//! let connection = Arc::new(BrokerConnection::new(
//!     Arc::new(MemoryTransport::new()),
//!     config.retry_policy(),
//! ));
//! let bus = Arc::new(EventBus::new(connection, &config));
//!
//! let store = Arc::new(MemoryStore::new());
//! let outbox = Arc::new(EventOutbox::new(store.clone(), &config));
//!
//! // Business write and outbox entry commit together
//! let tx = Transaction::new();
//! tx.put("orders", "42", &serde_json::json!({"status": "submitted"}))?;
//! let event = IntegrationEvent::new(&OrderStartedIntegrationEvent { user_id: "u1".into() })?;
//! outbox.enqueue(&event, &tx)?;
//! store.commit(tx).await?;
//!
//! // Drain the outbox to the broker
//! let publisher = OutboxPublisher::new(outbox, bus, config.outbox_poll_interval());
//! publisher.publish_pending().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory**: in-process broker for tests and single-process use
//! - **nats**: NATS JetStream for persistent, distributed delivery
//!
//! ## Architecture
//!
//! - **BrokerConnection**: one shared connection with bounded-retry reconnect
//! - **SubscriptionRegistry**: event type → handler identities
//! - **EventBus**: publish and dispatch, ack after handlers succeed
//! - **EventOutbox** / **OutboxPublisher**: atomic enqueue, background drain
//! - **IdempotencyGuard**: at-most-once command side effects

pub mod bus;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod outbox;
pub mod registry;
pub mod store;
pub mod transport;
pub mod types;

// Re-export core types
pub use bus::{DispatchOutcome, DispatchReport, EventBus, EventPublisher};
pub use config::{BusConfig, RetryPolicy};
pub use connection::{BrokerConnection, TopologyHook};
pub use dlq::{BrokerDlqHandler, DeadLetterEvent, DeadLetterReason, DlqHandler, MemoryDlqHandler};
pub use error::{Error, Result};
pub use handler::{DynamicEventHandler, HandlerError, IntegrationEventHandler};
pub use idempotency::{
    Command, CommandHandler, Execution, IdempotencyGuard, IdentifiedCommand,
    ProcessedRequestRecord,
};
pub use outbox::{DrainReport, EventOutbox, OutboxEntry, OutboxPublisher, OutboxState, PublisherHandle};
pub use registry::{HandlerId, RegistryEvent, SubscriptionRegistry};
pub use store::{
    FileStore, MemoryStore, OutboxStore, RequestStore, Store, Transaction, TransactionalStore,
};
pub use types::{event_name, EventPayload, IntegrationEvent, OutgoingMessage, ReceivedMessage};

// Re-export transports for convenience
pub use transport::memory::{MemoryBroker, MemoryTransport};
pub use transport::nats::{NatsConfig, NatsTransport, StorageType};
pub use transport::{Channel, Consumer, Delivery, QueueOptions, Transport};
