//! JetStream pull consumer adapted to the `Consumer` trait

use super::config::routing_key;
use crate::error::{Error, Result};
use crate::transport::{Consumer, Delivery};
use crate::types::ReceivedMessage;
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Delivery stream of one durable JetStream consumer
pub struct NatsConsumer {
    messages: Mutex<jetstream::consumer::pull::Stream>,
    exchange: String,
}

impl NatsConsumer {
    pub(super) fn new(messages: jetstream::consumer::pull::Stream, exchange: String) -> Self {
        Self {
            messages: Mutex::new(messages),
            exchange,
        }
    }
}

#[async_trait]
impl Consumer for NatsConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let msg = match self.messages.get_mut().next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(Error::Transport(format!("Error receiving message: {}", e)))
            }
            None => return Ok(None),
        };

        let (delivery_count, sequence) = match msg.info() {
            Ok(info) => (info.delivered.max(1) as u64, info.stream_sequence),
            Err(_) => (1, 0),
        };

        let message_id = msg
            .headers
            .as_ref()
            .and_then(|h| h.get("Nats-Msg-Id"))
            .map(|v| v.as_str().to_string());

        let received = ReceivedMessage {
            routing_key: routing_key(&self.exchange, msg.subject.as_str()).to_string(),
            body: msg.payload.clone(),
            message_id,
            delivery_count,
            sequence,
        };

        let ack_msg = Arc::new(msg);
        let nak_msg = Arc::clone(&ack_msg);

        Ok(Some(Delivery::new(
            received,
            move || {
                Box::pin(async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| Error::Ack(format!("Failed to ack message: {}", e)))
                })
            },
            move || {
                Box::pin(async move {
                    nak_msg
                        .ack_with(jetstream::AckKind::Nak(None))
                        .await
                        .map_err(|e| Error::Ack(format!("Failed to nak message: {}", e)))
                })
            },
        )))
    }
}
