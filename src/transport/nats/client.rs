//! NATS JetStream channel: exchange/queue topology over streams and consumers
//!
//! Mapping: an exchange is a stream capturing `<exchange>.>`, a routing key
//! is the subject suffix, a queue is a durable pull consumer whose
//! `filter_subjects` are its bindings. The consumer is deleted when its
//! last binding goes away.

use super::config::{consumer_name, routing_subject, stream_name, NatsConfig, StorageType};
use super::consumer::NatsConsumer;
use crate::error::{Error, Result};
use crate::transport::{Channel, Consumer, QueueOptions, Transport};
use crate::types::OutgoingMessage;
use async_nats::jetstream;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Transport opening NATS JetStream connections
#[derive(Debug, Clone)]
pub struct NatsTransport {
    config: Arc<NatsConfig>,
}

impl NatsTransport {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        let client = build_connect_options(&self.config)
            .connect(&self.config.url)
            .await
            .map_err(|e| Error::Transport(format!("{}: {}", self.config.url, e)))?;

        tracing::info!(url = %self.config.url, "Connected to NATS");

        Ok(Arc::new(NatsChannel {
            jetstream: jetstream::new(client.clone()),
            client,
            config: Arc::clone(&self.config),
            streams: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct QueueBinding {
    exchange: String,
    options: QueueOptions,
    routing_keys: BTreeSet<String>,
}

/// One NATS connection with its JetStream context
pub struct NatsChannel {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: Arc<NatsConfig>,
    streams: Mutex<HashMap<String, jetstream::stream::Stream>>,
    queues: Mutex<HashMap<String, QueueBinding>>,
    closed: AtomicBool,
}

impl NatsChannel {
    async fn stream(&self, exchange: &str) -> Result<jetstream::stream::Stream> {
        if let Some(stream) = self.streams.lock().await.get(exchange) {
            return Ok(stream.clone());
        }
        self.declare_exchange(exchange).await?;
        self.streams
            .lock()
            .await
            .get(exchange)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("stream for '{}' missing", exchange)))
    }

    /// Create or update the durable consumer to match the queue's bindings
    async fn sync_consumer(&self, queue: &str) -> Result<()> {
        let (exchange, options, keys) = {
            let queues = self.queues.lock().await;
            let binding = queues
                .get(queue)
                .ok_or_else(|| Error::Consumer(format!("queue '{}' not declared", queue)))?;
            (
                binding.exchange.clone(),
                binding.options.clone(),
                binding.routing_keys.clone(),
            )
        };

        let stream = self.stream(&exchange).await?;
        let durable = consumer_name(queue);

        if keys.is_empty() {
            if let Err(e) = stream.delete_consumer(&durable).await {
                tracing::debug!(consumer = %durable, error = %e, "No consumer to delete");
            }
            tracing::info!(consumer = %durable, "Consumer removed, no bindings left");
            return Ok(());
        }

        let filter_subjects: Vec<String> = keys
            .iter()
            .map(|key| routing_subject(&exchange, key))
            .collect();

        stream
            .create_consumer(build_consumer_config(&durable, filter_subjects.clone(), &options))
            .await
            .map_err(|e| {
                Error::Consumer(format!("Failed to upsert consumer '{}': {}", durable, e))
            })?;

        tracing::info!(
            consumer = %durable,
            filters = ?filter_subjects,
            "Consumer bindings updated"
        );
        Ok(())
    }
}

#[async_trait]
impl Channel for NatsChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let storage = match self.config.storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        };

        let stream_config = jetstream::stream::Config {
            name: stream_name(exchange),
            subjects: vec![format!("{}.>", exchange)],
            storage,
            max_age: Duration::from_secs(self.config.max_age_secs),
            duplicate_window: Duration::from_secs(self.config.duplicate_window_secs),
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| {
                Error::Transport(format!(
                    "Failed to create/get stream for exchange '{}': {}",
                    exchange, e
                ))
            })?;

        self.streams
            .lock()
            .await
            .insert(exchange.to_string(), stream);

        tracing::debug!(exchange, stream = %stream_name(exchange), "Exchange declared");
        Ok(())
    }

    async fn declare_queue(
        &self,
        exchange: &str,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .and_modify(|binding| binding.options = options.clone())
            .or_insert_with(|| QueueBinding {
                exchange: exchange.to_string(),
                options: options.clone(),
                routing_keys: BTreeSet::new(),
            });
        Ok(())
    }

    async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let added = {
            let mut queues = self.queues.lock().await;
            let binding = queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueBinding {
                    exchange: exchange.to_string(),
                    options: QueueOptions::default(),
                    routing_keys: BTreeSet::new(),
                });
            binding.routing_keys.insert(routing_key.to_string())
        };

        if added {
            self.sync_consumer(queue).await?;
        }
        Ok(())
    }

    async fn unbind(&self, _exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let removed = {
            let mut queues = self.queues.lock().await;
            queues
                .get_mut(queue)
                .map(|binding| binding.routing_keys.remove(routing_key))
                .unwrap_or(false)
        };

        if removed {
            self.sync_consumer(queue).await?;
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<()> {
        let subject = routing_subject(exchange, &message.routing_key);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.message_id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, message.body)
            .await
            .map_err(|e| Error::Transport(format!("publish to '{}': {}", subject, e)))?
            .await
            .map_err(|e| Error::Transport(format!("publish ack for '{}': {}", subject, e)))?;

        tracing::debug!(
            subject = %subject,
            message_id = %message.message_id,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Message published"
        );
        Ok(())
    }

    async fn consume(&self, exchange: &str, queue: &str) -> Result<Box<dyn Consumer>> {
        let stream = self.stream(exchange).await?;
        let durable = consumer_name(queue);

        let consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config> = stream
            .get_consumer(&durable)
            .await
            .map_err(|e| Error::Consumer(format!("Failed to get consumer '{}': {}", durable, e)))?;

        let messages = consumer.messages().await.map_err(|e| {
            Error::Consumer(format!("Failed to open message stream for '{}': {}", durable, e))
        })?;

        tracing::info!(consumer = %durable, exchange, "Consuming queue");
        Ok(Box::new(NatsConsumer::new(messages, exchange.to_string())))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("flush on close: {}", e)))
    }
}

/// Build the durable pull consumer config for a queue
fn build_consumer_config(
    durable: &str,
    filter_subjects: Vec<String>,
    options: &QueueOptions,
) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(durable.to_string()),
        filter_subjects,
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: jetstream::consumer::DeliverPolicy::New,
        max_deliver: options.max_deliver.unwrap_or(0),
        max_ack_pending: options.max_ack_pending.unwrap_or(0),
        ack_wait: options.ack_wait.unwrap_or_default(),
        ..Default::default()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        opts = opts.user_and_password(user.clone(), password.clone());
    } else if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}
