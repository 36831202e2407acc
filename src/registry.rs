//! In-memory subscription registry
//!
//! Maps event type names to the identities of handlers registered for
//! them. The registry never owns handler instances; the bus looks the
//! identities up in its handler table at dispatch time. Rebuilt on every
//! process start.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{broadcast, RwLock};

/// Identity of a registered handler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity derived from the handler's Rust type
    pub fn of<H: ?Sized>() -> Self {
        Self(std::any::type_name::<H>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change notifications emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An event type received its first handler
    Added { event_type: String },
    /// The last handler of an event type was removed
    Removed { event_type: String },
}

/// Event type → handler identities, safe under concurrent access
pub struct SubscriptionRegistry {
    handlers: RwLock<HashMap<String, Vec<HandlerId>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register a handler identity for an event type
    ///
    /// Returns `true` when this is the first handler for the type.
    pub async fn subscribe(&self, event_type: &str, handler: HandlerId) -> Result<bool> {
        let first = {
            let mut handlers = self.handlers.write().await;
            let ids = handlers.entry(event_type.to_string()).or_default();
            if ids.contains(&handler) {
                return Err(Error::AlreadySubscribed {
                    event_type: event_type.to_string(),
                    handler: handler.to_string(),
                });
            }
            ids.push(handler.clone());
            ids.len() == 1
        };

        tracing::debug!(event_type, handler = %handler, first, "Handler subscribed");
        if first {
            let _ = self.events.send(RegistryEvent::Added {
                event_type: event_type.to_string(),
            });
        }
        Ok(first)
    }

    /// Remove a handler identity
    ///
    /// Returns `true` when the event type has no handlers left.
    pub async fn unsubscribe(&self, event_type: &str, handler: &HandlerId) -> bool {
        let emptied = {
            let mut handlers = self.handlers.write().await;
            let Some(ids) = handlers.get_mut(event_type) else {
                return false;
            };
            let before = ids.len();
            ids.retain(|id| id != handler);
            if ids.len() == before {
                return false;
            }
            if ids.is_empty() {
                handlers.remove(event_type);
                true
            } else {
                false
            }
        };

        tracing::debug!(event_type, handler = %handler, emptied, "Handler unsubscribed");
        if emptied {
            let _ = self.events.send(RegistryEvent::Removed {
                event_type: event_type.to_string(),
            });
        }
        emptied
    }

    /// Handlers for an event type, in registration order
    pub async fn handlers_for(&self, event_type: &str) -> Vec<HandlerId> {
        self.handlers
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, event_type: &str) -> bool {
        self.handlers.read().await.contains_key(event_type)
    }

    /// Subscribed event types, sorted
    pub async fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Remove every subscription, emitting `Removed` for each type
    pub async fn clear(&self) {
        let removed: Vec<String> = self.handlers.write().await.drain().map(|(k, _)| k).collect();
        for event_type in removed {
            let _ = self.events.send(RegistryEvent::Removed { event_type });
        }
    }

    /// Receive registry change notifications
    pub fn watch(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_subscribe_and_lookup() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty().await);

        let first = registry
            .subscribe("OrderStarted", HandlerId::new("basket"))
            .await
            .unwrap();
        let second = registry
            .subscribe("OrderStarted", HandlerId::new("audit"))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert!(registry.is_subscribed("OrderStarted").await);
        assert!(!registry.is_subscribed("OrderShipped").await);
        assert_eq!(
            registry.handlers_for("OrderStarted").await,
            vec![HandlerId::new("basket"), HandlerId::new("audit")]
        );
        assert!(registry.handlers_for("OrderShipped").await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe("OrderStarted", HandlerId::new("basket"))
            .await
            .unwrap();
        let err = registry
            .subscribe("OrderStarted", HandlerId::new("basket"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySubscribed { .. }));
        assert_eq!(registry.handlers_for("OrderStarted").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_handler_notifies() {
        let registry = SubscriptionRegistry::new();
        let mut events = registry.watch();

        registry
            .subscribe("OrderStarted", HandlerId::new("a"))
            .await
            .unwrap();
        registry
            .subscribe("OrderStarted", HandlerId::new("b"))
            .await
            .unwrap();

        assert!(!registry.unsubscribe("OrderStarted", &HandlerId::new("a")).await);
        assert!(registry.unsubscribe("OrderStarted", &HandlerId::new("b")).await);
        assert!(!registry.unsubscribe("OrderStarted", &HandlerId::new("b")).await);
        assert!(registry.is_empty().await);

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Added {
                event_type: "OrderStarted".into()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed {
                event_type: "OrderStarted".into()
            }
        );
    }

    #[tokio::test]
    async fn test_clear_and_event_types() {
        let registry = SubscriptionRegistry::new();
        for t in ["UserCheckoutAccepted", "OrderStarted"] {
            registry.subscribe(t, HandlerId::new("h")).await.unwrap();
        }
        assert_eq!(
            registry.event_types().await,
            vec!["OrderStarted".to_string(), "UserCheckoutAccepted".to_string()]
        );
        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_subscriptions() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .subscribe("OrderStarted", HandlerId::new(format!("h{}", i)))
                    .await
            }));
        }

        let mut firsts = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                firsts += 1;
            }
        }
        assert_eq!(firsts, 1);
        assert_eq!(registry.handlers_for("OrderStarted").await.len(), 32);
    }

    #[test]
    fn test_handler_id_of_type() {
        struct GracePeriodConfirmedHandler;
        let id = HandlerId::of::<GracePeriodConfirmedHandler>();
        assert!(id.as_str().ends_with("GracePeriodConfirmedHandler"));
    }
}
