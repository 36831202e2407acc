//! Integration event bus
//!
//! `EventBus` publishes outbound events through a shared `BrokerConnection`
//! and dispatches inbound deliveries to the handlers registered for their
//! type. One bus per process; all subscribed types share one queue named
//! after the subscription client, bound once per type.

use crate::config::{BusConfig, RetryPolicy};
use crate::connection::{BrokerConnection, TopologyHook};
use crate::dlq::{should_dead_letter, DeadLetterEvent, DeadLetterReason, DlqHandler, MemoryDlqHandler};
use crate::error::{Error, Result};
use crate::handler::{
    self, BoxedHandler, DynamicEventHandler, HandlerError, HandlerTable, IntegrationEventHandler,
};
use crate::registry::{HandlerId, RegistryEvent, SubscriptionRegistry};
use crate::transport::{Channel, Consumer, Delivery, QueueOptions};
use crate::types::{EventPayload, IntegrationEvent, OutgoingMessage};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Anything that can put an integration event on the wire
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()>;
}

/// What the bus did with one inbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler succeeded
    Acked,
    /// A handler failed transiently; the broker will redeliver
    Requeued,
    /// Transient failures outlasted the redelivery budget
    DeadLettered,
    /// Undecodable or terminally rejected; acked without retry
    Poisoned,
    /// No handler registered for the type
    Unhandled,
}

/// Completion record broadcast for every dispatched delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// `None` when the envelope could not be decoded
    pub event_id: Option<Uuid>,
    pub type_name: String,
    pub delivery_count: u64,
    pub outcome: DispatchOutcome,
}

struct ConsumerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct BusInner {
    connection: Arc<BrokerConnection>,
    registry: Arc<SubscriptionRegistry>,
    handlers: RwLock<HandlerTable>,
    /// Held across a registry change and the matching bind or unbind
    bindings: Mutex<()>,
    dlq: Arc<dyn DlqHandler>,
    topology: Arc<BusTopology>,
    retry: RetryPolicy,
    max_redeliveries: u64,
    prefetch: u32,
    inflight: Arc<Semaphore>,
    outcomes: broadcast::Sender<DispatchReport>,
}

/// Exchange, queue and per-type bindings of one bus
struct BusTopology {
    exchange: String,
    queue: String,
    options: QueueOptions,
    registry: Arc<SubscriptionRegistry>,
}

#[async_trait]
impl TopologyHook for BusTopology {
    async fn declare(&self, channel: &dyn Channel) -> Result<()> {
        channel.declare_exchange(&self.exchange).await?;
        channel
            .declare_queue(&self.exchange, &self.queue, &self.options)
            .await?;
        for event_type in self.registry.event_types().await {
            channel.bind(&self.exchange, &self.queue, &event_type).await?;
        }
        Ok(())
    }
}

/// Publishes integration events and dispatches inbound ones to handlers
///
/// ```rust,no_run
/// use eshop_event_bus::{BrokerConnection, BusConfig, EventBus, MemoryTransport};
/// use std::sync::Arc;
///
/// # async fn run() -> eshop_event_bus::Result<()> {
/// let config = BusConfig::default();
/// let connection = Arc::new(BrokerConnection::new(
///     Arc::new(MemoryTransport::new()),
///     config.retry_policy(),
/// ));
/// let bus = EventBus::new(connection, &config);
/// bus.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    inner: Arc<BusInner>,
    consumer: Mutex<Option<ConsumerTask>>,
}

impl EventBus {
    /// Create a bus recording dead letters in memory
    pub fn new(connection: Arc<BrokerConnection>, config: &BusConfig) -> Self {
        Self::with_dlq(connection, config, Arc::new(MemoryDlqHandler::default()))
    }

    /// Create a bus with a custom dead-letter handler
    pub fn with_dlq(
        connection: Arc<BrokerConnection>,
        config: &BusConfig,
        dlq: Arc<dyn DlqHandler>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let prefetch = u32::try_from(config.prefetch.clamp(1, 10_000)).unwrap_or(16);

        let topology = Arc::new(BusTopology {
            exchange: config.exchange_name.clone(),
            queue: config.subscription_client_name.clone(),
            options: QueueOptions {
                max_deliver: None,
                max_ack_pending: Some(i64::from(prefetch)),
                ack_wait: None,
            },
            registry: Arc::clone(&registry),
        });
        connection.add_topology_hook(topology.clone());

        let (outcomes, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(BusInner {
                connection,
                registry,
                handlers: RwLock::new(HandlerTable::default()),
                bindings: Mutex::new(()),
                dlq,
                topology,
                retry: config.retry_policy(),
                max_redeliveries: config.max_redeliveries,
                prefetch,
                inflight: Arc::new(Semaphore::new(prefetch as usize)),
                outcomes,
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.topology.exchange
    }

    /// Queue shared by every subscription of this process
    pub fn queue_name(&self) -> &str {
        &self.inner.topology.queue
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.inner.connection
    }

    pub fn dlq(&self) -> &Arc<dyn DlqHandler> {
        &self.inner.dlq
    }

    /// Receive a report for every dispatched delivery
    pub fn outcomes(&self) -> broadcast::Receiver<DispatchReport> {
        self.inner.outcomes.subscribe()
    }

    /// Publish an event with bounded retry
    ///
    /// Routing key is the event's type name; the event id doubles as the
    /// broker message id.
    pub async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        self.inner.publish(event).await
    }

    /// Register a typed handler for `E`
    ///
    /// The first handler for a type binds its routing key to the queue.
    pub async fn subscribe<E, H>(&self, handler: H) -> Result<()>
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        self.register(E::NAME, HandlerId::of::<H>(), handler::typed::<E, H>(handler))
            .await
    }

    /// Register a handler receiving the raw JSON payload of `event_type`
    pub async fn subscribe_dynamic<H>(&self, event_type: &str, handler: H) -> Result<()>
    where
        H: DynamicEventHandler,
    {
        self.register(event_type, HandlerId::of::<H>(), handler::dynamic(handler))
            .await
    }

    /// Remove the typed handler `H` for `E`
    pub async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        self.deregister(E::NAME, &HandlerId::of::<H>()).await
    }

    /// Remove the dynamic handler `H` for `event_type`
    pub async fn unsubscribe_dynamic<H>(&self, event_type: &str) -> Result<()>
    where
        H: DynamicEventHandler,
    {
        self.deregister(event_type, &HandlerId::of::<H>()).await
    }

    /// Start consuming the queue
    ///
    /// Idempotent. Fails with `BrokerUnavailable` when the broker cannot be
    /// reached within the retry budget.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.consumer.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let channel = self.inner.connection.ensure_connected().await?;
        self.inner.topology.declare(channel.as_ref()).await?;

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(consume_loop(Arc::clone(&self.inner), rx));
        *task = Some(ConsumerTask { shutdown, handle });

        tracing::info!(
            exchange = %self.inner.topology.exchange,
            queue = %self.inner.topology.queue,
            transport = self.inner.connection.transport_name(),
            "Event bus started"
        );
        Ok(())
    }

    /// Stop consuming and wait for in-flight handlers to finish
    ///
    /// The shared broker connection stays open for other users.
    pub async fn stop(&self) -> Result<()> {
        let task = self.consumer.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            tracing::warn!(error = %e, "Consumer task ended abnormally");
        }

        if let Ok(permits) = self.inner.inflight.acquire_many(self.inner.prefetch).await {
            drop(permits);
        }

        tracing::info!(queue = %self.inner.topology.queue, "Event bus stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    async fn register(&self, event_type: &str, id: HandlerId, boxed: BoxedHandler) -> Result<()> {
        let _bindings = self.inner.bindings.lock().await;
        if !self
            .inner
            .handlers
            .write()
            .await
            .insert(event_type, id.clone(), boxed)
        {
            return Err(Error::AlreadySubscribed {
                event_type: event_type.to_string(),
                handler: id.to_string(),
            });
        }

        let first = match self.inner.registry.subscribe(event_type, id.clone()).await {
            Ok(first) => first,
            Err(e) => {
                self.inner.handlers.write().await.remove(event_type, &id);
                return Err(e);
            }
        };

        if first {
            self.inner.bind(event_type).await;
        }

        tracing::info!(event_type, handler = %id, "Subscribed to event");
        Ok(())
    }

    async fn deregister(&self, event_type: &str, id: &HandlerId) -> Result<()> {
        let _bindings = self.inner.bindings.lock().await;
        self.inner.handlers.write().await.remove(event_type, id);
        if self.inner.registry.unsubscribe(event_type, id).await {
            self.inner.unbind(event_type).await;
        }
        tracing::info!(event_type, handler = %id, "Unsubscribed from event");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        self.inner.publish(event).await
    }
}

impl BusInner {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let message = OutgoingMessage::for_event(event)?;
        let max_attempts = self.retry.max_attempts().max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let channel = match self.connection.ensure_connected().await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id(),
                        type_name = %event.type_name(),
                        error = %e,
                        "Publish aborted, broker unavailable"
                    );
                    return Err(Error::PublishFailed {
                        type_name: event.type_name().to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            };

            match channel
                .publish(&self.topology.exchange, message.clone())
                .await
            {
                Ok(()) => {
                    tracing::debug!(
                        event_id = %event.id(),
                        type_name = %event.type_name(),
                        attempt,
                        "Event published"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    self.connection.mark_down(&channel, &last_error).await;
                    if attempt < max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt - 1);
                        tracing::warn!(
                            event_id = %event.id(),
                            type_name = %event.type_name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Publish failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(
            event_id = %event.id(),
            type_name = %event.type_name(),
            attempts = max_attempts,
            error = %last_error,
            "Publish retries exhausted"
        );
        Err(Error::PublishFailed {
            type_name: event.type_name().to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Bind a routing key now, or leave it to the next (re)connect
    async fn bind(&self, event_type: &str) {
        let result = async {
            let channel = self.connection.ensure_connected().await?;
            let topology = &self.topology;
            channel.declare_exchange(&topology.exchange).await?;
            channel
                .declare_queue(&topology.exchange, &topology.queue, &topology.options)
                .await?;
            channel
                .bind(&topology.exchange, &topology.queue, event_type)
                .await
        }
        .await;

        match result {
            Ok(()) => tracing::debug!(event_type, queue = %self.topology.queue, "Routing key bound"),
            Err(e) => tracing::warn!(
                event_type,
                error = %e,
                "Binding deferred until the broker is reachable"
            ),
        }
    }

    async fn unbind(&self, event_type: &str) {
        if !self.connection.is_connected() {
            return;
        }
        let result = async {
            let channel = self.connection.ensure_connected().await?;
            channel
                .unbind(&self.topology.exchange, &self.topology.queue, event_type)
                .await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(event_type, error = %e, "Failed to unbind routing key");
        }
    }

    async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let message = delivery.message.clone();
        let type_name = message.routing_key.clone();

        let event = match IntegrationEvent::from_slice(&message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    type_name = %type_name,
                    error = %e,
                    "Undecodable message, acking as poison"
                );
                self.dead_letter(&delivery.message, DeadLetterReason::Poison(e.to_string()))
                    .await;
                self.settle(delivery, true).await;
                return self.report(None, type_name, message.delivery_count, DispatchOutcome::Poisoned);
            }
        };

        let ids = self.registry.handlers_for(&type_name).await;
        let handlers: Vec<(HandlerId, BoxedHandler)> = {
            let table = self.handlers.read().await;
            ids.into_iter()
                .filter_map(|id| table.get(&type_name, &id).map(|h| (id, h)))
                .collect()
        };

        if handlers.is_empty() {
            tracing::debug!(event_id = %event.id(), type_name = %type_name, "No handler for event");
            self.settle(delivery, true).await;
            return self.report(
                Some(event.id()),
                type_name,
                message.delivery_count,
                DispatchOutcome::Unhandled,
            );
        }

        let mut failure = None;
        for (id, handle) in handlers {
            let result = match AssertUnwindSafe(handle(event.clone())).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(
                        event_id = %event.id(),
                        type_name = %type_name,
                        handler = %id,
                        panic = %reason,
                        "Handler panicked"
                    );
                    Err(HandlerError::Transient(format!("handler panicked: {}", reason)))
                }
            };
            if let Err(e) = result {
                failure = Some((id, e));
                break;
            }
        }

        let outcome = match failure {
            None => {
                tracing::debug!(
                    event_id = %event.id(),
                    type_name = %type_name,
                    delivery_count = message.delivery_count,
                    "Event handled"
                );
                self.settle(delivery, true).await;
                DispatchOutcome::Acked
            }
            Some((id, e)) if !e.is_transient() => {
                tracing::warn!(
                    event_id = %event.id(),
                    type_name = %type_name,
                    handler = %id,
                    error = %e,
                    "Poison event, acking without retry"
                );
                self.dead_letter(&message, DeadLetterReason::Poison(e.to_string()))
                    .await;
                self.settle(delivery, true).await;
                DispatchOutcome::Poisoned
            }
            Some((id, e)) if should_dead_letter(&message, self.max_redeliveries) => {
                tracing::warn!(
                    event_id = %event.id(),
                    type_name = %type_name,
                    handler = %id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Redelivery budget exhausted"
                );
                self.dead_letter(
                    &message,
                    DeadLetterReason::MaxRedeliveries {
                        deliveries: message.delivery_count,
                        last_error: e.to_string(),
                    },
                )
                .await;
                self.settle(delivery, true).await;
                DispatchOutcome::DeadLettered
            }
            Some((id, e)) => {
                tracing::warn!(
                    event_id = %event.id(),
                    type_name = %type_name,
                    handler = %id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Handler failed, requeueing"
                );
                self.settle(delivery, false).await;
                DispatchOutcome::Requeued
            }
        };

        self.report(Some(event.id()), type_name, message.delivery_count, outcome)
    }

    async fn dead_letter(&self, message: &crate::types::ReceivedMessage, reason: DeadLetterReason) {
        if let Err(e) = self
            .dlq
            .handle(DeadLetterEvent::new(message.clone(), reason))
            .await
        {
            tracing::error!(
                routing_key = %message.routing_key,
                error = %e,
                "Failed to record dead letter"
            );
        }
    }

    async fn settle(&self, delivery: Delivery, ack: bool) {
        let sequence = delivery.message.sequence;
        let result = if ack {
            delivery.ack().await
        } else {
            delivery.nak().await
        };
        if let Err(e) = result {
            tracing::warn!(sequence, ack, error = %e, "Failed to settle delivery");
        }
    }

    fn report(
        &self,
        event_id: Option<Uuid>,
        type_name: String,
        delivery_count: u64,
        outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        let _ = self.outcomes.send(DispatchReport {
            event_id,
            type_name,
            delivery_count,
            outcome,
        });
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Sleep unless shutdown is requested first; returns true on shutdown
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
    }
}

async fn consume_loop(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
    let mut registry_events = inner.registry.watch();
    let mut failures: u32 = 0;

    'session: loop {
        if *shutdown.borrow() {
            break;
        }

        if inner.registry.is_empty().await {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = registry_events.recv() => continue,
            }
        }

        let (channel, mut consumer) = match open_consumer(&inner).await {
            Ok(opened) => {
                failures = 0;
                opened
            }
            Err(e) => {
                let delay = inner.retry.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                tracing::warn!(
                    queue = %inner.topology.queue,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to open consumer, retrying"
                );
                if pause(&mut shutdown, delay).await {
                    break;
                }
                continue;
            }
        };

        tracing::info!(queue = %inner.topology.queue, "Consuming");

        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => break 'session,
                permit = Arc::clone(&inner.inflight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'session,
                },
            };

            let next = tokio::select! {
                _ = shutdown.changed() => break 'session,
                event = registry_events.recv() => {
                    if matches!(event, Ok(RegistryEvent::Removed { .. }))
                        && inner.registry.is_empty().await
                    {
                        tracing::info!(queue = %inner.topology.queue, "No subscriptions left, pausing consumer");
                        continue 'session;
                    }
                    continue;
                }
                next = consumer.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        inner.dispatch(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    tracing::info!(queue = %inner.topology.queue, "Consumer closed, reopening");
                    continue 'session;
                }
                Err(e) => {
                    tracing::warn!(queue = %inner.topology.queue, error = %e, "Consumer failed");
                    inner.connection.mark_down(&channel, &e.to_string()).await;
                    if pause(&mut shutdown, inner.retry.delay_for_attempt(0)).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }
    }

    tracing::debug!(queue = %inner.topology.queue, "Consume loop exited");
}

/// Open a consumer and return it with the channel it runs on
async fn open_consumer(inner: &BusInner) -> Result<(Arc<dyn Channel>, Box<dyn Consumer>)> {
    let channel = inner.connection.ensure_connected().await?;
    inner.topology.declare(channel.as_ref()).await?;
    match channel
        .consume(&inner.topology.exchange, &inner.topology.queue)
        .await
    {
        Ok(consumer) => Ok((channel, consumer)),
        Err(e) => {
            inner.connection.mark_down(&channel, &e.to_string()).await;
            Err(e)
        }
    }
}
