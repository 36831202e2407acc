//! Core event types
//!
//! All wire types use camelCase JSON serialization so services written
//! against the same envelope interoperate.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A statically typed integration event payload
///
/// `NAME` is the stable type name used as routing key; it must not change
/// once consumers exist.
///
/// ```rust
/// use eshop_event_bus::EventPayload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct OrderStartedIntegrationEvent {
///     user_id: String,
/// }
///
/// impl EventPayload for OrderStartedIntegrationEvent {
///     const NAME: &'static str = "OrderStarted";
/// }
/// ```
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Derive an event name from a Rust type name
///
/// Strips the module path and a trailing `IntegrationEvent`, so
/// `ordering::OrderStartedIntegrationEvent` becomes `OrderStarted`.
pub fn event_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    short
        .strip_suffix("IntegrationEvent")
        .filter(|s| !s.is_empty())
        .unwrap_or(short)
        .to_string()
}

/// A fact about a completed local change, published across services
///
/// Immutable once created: fields are only readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    id: Uuid,
    occurred_at: DateTime<Utc>,
    type_name: String,
    payload: serde_json::Value,
}

impl IntegrationEvent {
    /// Create an event from a typed payload with a fresh id and timestamp
    pub fn new<E: EventPayload>(payload: &E) -> Result<Self> {
        Ok(Self::from_parts(E::NAME, serde_json::to_value(payload)?))
    }

    /// Create an event from a raw type name and JSON payload
    pub fn from_parts(type_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            type_name: type_name.into(),
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decode the payload into its typed form
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E> {
        Ok(E::deserialize(&self.payload)?)
    }

    /// Encode the whole envelope for the wire
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode an envelope received from the wire
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// A message handed to a transport for publication
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Routing key (the event type name)
    pub routing_key: String,

    /// Broker-side de-duplication id (the event id)
    pub message_id: String,

    /// Serialized `IntegrationEvent`
    pub body: Bytes,

    /// Survive broker restarts
    pub persistent: bool,
}

impl OutgoingMessage {
    /// Build a persistent message for an event
    pub fn for_event(event: &IntegrationEvent) -> Result<Self> {
        Ok(Self {
            routing_key: event.type_name().to_string(),
            message_id: event.id().to_string(),
            body: event.to_bytes()?,
            persistent: true,
        })
    }
}

/// A message received from a queue, with delivery context
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Routing key the message was published with
    pub routing_key: String,

    /// Raw message body
    pub body: Bytes,

    /// Publisher-assigned message id, when the transport carries one
    pub message_id: Option<String>,

    /// Number of delivery attempts, starting at 1
    pub delivery_count: u64,

    /// Transport-assigned sequence number
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderStatusChangedToPaidIntegrationEvent {
        order_id: u64,
        items: Vec<String>,
        note: Option<String>,
    }

    impl EventPayload for OrderStatusChangedToPaidIntegrationEvent {
        const NAME: &'static str = "OrderStatusChangedToPaid";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum PriceChange {
        Absolute { old: f64, new: f64 },
        Removed,
    }

    impl EventPayload for PriceChange {
        const NAME: &'static str = "ProductPriceChanged";
    }

    #[test]
    fn test_event_creation() {
        let event = IntegrationEvent::new(&OrderStatusChangedToPaidIntegrationEvent {
            order_id: 7,
            items: vec!["mug".into()],
            note: None,
        })
        .unwrap();

        assert_eq!(event.type_name(), "OrderStatusChangedToPaid");
        assert_eq!(event.payload()["orderId"], 7);
        assert!(event.occurred_at() <= Utc::now());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = IntegrationEvent::from_parts("A", serde_json::json!({}));
        let b = IntegrationEvent::from_parts("A", serde_json::json!({}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_payload_roundtrip_struct() {
        let payload = OrderStatusChangedToPaidIntegrationEvent {
            order_id: 42,
            items: vec!["cap".into(), "shirt".into()],
            note: Some("gift".into()),
        };
        let event = IntegrationEvent::new(&payload).unwrap();
        let wire = event.to_bytes().unwrap();
        let parsed = IntegrationEvent::from_slice(&wire).unwrap();

        assert_eq!(parsed, event);
        assert_eq!(
            parsed.decode::<OrderStatusChangedToPaidIntegrationEvent>().unwrap(),
            payload
        );
    }

    #[test]
    fn test_payload_roundtrip_enum() {
        for payload in [
            PriceChange::Absolute { old: 9.5, new: 12.0 },
            PriceChange::Removed,
        ] {
            let event = IntegrationEvent::new(&payload).unwrap();
            let parsed = IntegrationEvent::from_slice(&event.to_bytes().unwrap()).unwrap();
            assert_eq!(parsed.decode::<PriceChange>().unwrap(), payload);
        }
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({"userId": "u1"}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"typeName\":\"OrderStarted\""));
        assert!(json.contains("\"occurredAt\""));
        assert!(json.contains("\"userId\":\"u1\""));
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let event = IntegrationEvent::from_parts("OrderStatusChangedToPaid", serde_json::json!({"orderId": "x"}));
        assert!(event
            .decode::<OrderStatusChangedToPaidIntegrationEvent>()
            .is_err());
    }

    #[test]
    fn test_event_name_strips_suffix() {
        assert_eq!(
            event_name::<OrderStatusChangedToPaidIntegrationEvent>(),
            "OrderStatusChangedToPaid"
        );
        assert_eq!(event_name::<PriceChange>(), "PriceChange");
    }

    #[test]
    fn test_outgoing_message_for_event() {
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({}));
        let msg = OutgoingMessage::for_event(&event).unwrap();
        assert_eq!(msg.routing_key, "OrderStarted");
        assert_eq!(msg.message_id, event.id().to_string());
        assert!(msg.persistent);
    }
}
