//! NATS transport configuration

use crate::config::BusConfig;
use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    /// Persistent file storage (messages survive server restarts)
    #[default]
    File,
    /// Memory storage
    Memory,
}

/// Connection and stream settings for the NATS JetStream transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Auth token (alternative to user/password)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Stream storage; `File` gives persistent delivery
    #[serde(default)]
    pub storage: StorageType,

    /// Maximum message age in seconds (0 = unlimited)
    #[serde(default)]
    pub max_age_secs: u64,

    /// Window in which duplicate message ids are discarded by the server
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_duplicate_window_secs() -> u64 {
    120
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".into(),
            user: None,
            password: None,
            token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            storage: StorageType::File,
            max_age_secs: 0,
            duplicate_window_secs: default_duplicate_window_secs(),
        }
    }
}

impl NatsConfig {
    /// Derive transport settings from the bus configuration
    pub fn from_bus(bus: &BusConfig) -> Self {
        Self {
            url: bus.connection.clone(),
            user: bus.username.clone(),
            password: bus.password.clone(),
            ..Default::default()
        }
    }
}

/// JetStream stream name for an exchange
///
/// Stream names may not contain `.`, `*`, `>`, or whitespace.
pub fn stream_name(exchange: &str) -> String {
    sanitize(exchange).to_uppercase()
}

/// Durable consumer name for a queue
pub fn consumer_name(queue: &str) -> String {
    sanitize(queue)
}

/// Subject carrying a routing key on an exchange
pub fn routing_subject(exchange: &str, routing_key: &str) -> String {
    format!("{}.{}", exchange, routing_key)
}

/// Routing key of a subject published on an exchange
pub fn routing_key<'a>(exchange: &str, subject: &'a str) -> &'a str {
    subject
        .strip_prefix(exchange)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(subject)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' | '\t' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}
