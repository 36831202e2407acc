//! Event handler traits and the type-erased handler table
//!
//! Handlers are registered explicitly at startup. Each registration is
//! stored as a closure keyed by event type and handler identity; the
//! closure decodes the payload into the handler's static type.

use crate::registry::HandlerId;
use crate::types::{EventPayload, IntegrationEvent};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a business handler
///
/// The bus retries `Transient` failures through broker redelivery and
/// acknowledges everything else as a poison message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Recoverable; the message will be redelivered
    #[error("transient failure: {0}")]
    Transient(String),

    /// Permanent; redelivery would fail the same way
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// Payload could not be decoded
    #[error("malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<crate::error::Error> for HandlerError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Serialization(e) => HandlerError::Serialization(e),
            crate::error::Error::Handler(e) => e,
            other @ (crate::error::Error::Command { .. }
            | crate::error::Error::InvalidRequestId(_)) => {
                HandlerError::Terminal(other.to_string())
            }
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

/// Handler for a statically typed integration event
#[async_trait]
pub trait IntegrationEventHandler<E: EventPayload>: Send + Sync + 'static {
    /// Handle one event; `payload` is the decoded body of `event`
    async fn handle(&self, event: &IntegrationEvent, payload: E) -> Result<(), HandlerError>;
}

/// Handler receiving the raw JSON payload
///
/// For consumers that react to an event type without compiling its schema.
#[async_trait]
pub trait DynamicEventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError>;
}

pub(crate) type BoxedHandler =
    Arc<dyn Fn(IntegrationEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

pub(crate) fn typed<E, H>(handler: H) -> BoxedHandler
where
    E: EventPayload,
    H: IntegrationEventHandler<E>,
{
    let handler = Arc::new(handler);
    Arc::new(move |event: IntegrationEvent| {
        let handler = Arc::clone(&handler);
        async move {
            let payload: E = serde_json::from_value(event.payload().clone())?;
            handler.handle(&event, payload).await
        }
        .boxed()
    })
}

pub(crate) fn dynamic<H: DynamicEventHandler>(handler: H) -> BoxedHandler {
    let handler = Arc::new(handler);
    Arc::new(move |event: IntegrationEvent| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(&event).await }.boxed()
    })
}

/// Registration table: (event type, handler identity) → closure
#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: HashMap<(String, HandlerId), BoxedHandler>,
}

impl HandlerTable {
    /// Returns false when the pair is already registered
    pub(crate) fn insert(&mut self, event_type: &str, id: HandlerId, handler: BoxedHandler) -> bool {
        let key = (event_type.to_string(), id);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, handler);
        true
    }

    pub(crate) fn remove(&mut self, event_type: &str, id: &HandlerId) -> Option<BoxedHandler> {
        self.entries.remove(&(event_type.to_string(), id.clone()))
    }

    pub(crate) fn get(&self, event_type: &str, id: &HandlerId) -> Option<BoxedHandler> {
        self.entries
            .get(&(event_type.to_string(), id.clone()))
            .cloned()
    }
}
