//! NATS JetStream transport
//!
//! Implements `Transport` over NATS JetStream for persistent, at-least-once
//! delivery with server-side de-duplication on the event id.

mod client;
mod config;
mod consumer;

pub use client::{NatsChannel, NatsTransport};
pub use config::{consumer_name, routing_key, routing_subject, stream_name, NatsConfig, StorageType};
pub use consumer::NatsConsumer;
