//! Error types for the integration event bus

use crate::handler::HandlerError;
use crate::outbox::OutboxState;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while publishing, dispatching, or storing events
#[derive(Debug, Error)]
pub enum Error {
    /// Broker could not be reached within the configured retry budget
    #[error("Broker unavailable after {attempts} attempt(s): {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    /// Transport-level failure on an established connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Publish retries exhausted
    #[error("Failed to publish '{type_name}' after {attempts} attempt(s): {reason}")]
    PublishFailed {
        type_name: String,
        attempts: u32,
        reason: String,
    },

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Business handler failure
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Lost a uniqueness race on a request id; the winner's record exists
    #[error("Concurrent duplicate insert for request '{request_id}'")]
    ConcurrentDuplicateInsert { request_id: String },

    /// Request id missing or blank
    #[error("Invalid request id: '{0}'")]
    InvalidRequestId(String),

    /// The same handler registered twice for one event type
    #[error("Handler '{handler}' is already subscribed to '{event_type}'")]
    AlreadySubscribed { event_type: String, handler: String },

    /// Outbox state machine violation
    #[error("Invalid outbox transition for event {event_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        event_id: Uuid,
        from: OutboxState,
        to: OutboxState,
    },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consumer/queue creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// A command rejected by its handler
    #[error("Command '{command}' rejected: {reason}")]
    Command { command: String, reason: String },
}

impl Error {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BrokerUnavailable { .. }
            | Error::Transport(_)
            | Error::PublishFailed { .. }
            | Error::Consumer(_)
            | Error::Ack(_) => true,
            Error::Handler(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, Error>;
