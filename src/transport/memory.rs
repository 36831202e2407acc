//! In-memory broker for testing and single-process use
//!
//! Emulates a topic exchange with named queues, routing-key bindings,
//! manual ack, and redelivery on nak. A delivered message stays unacked
//! until settled; it is requeued when nacked, when its `Delivery` is dropped
//! unsettled, or when the channel that received it closes. Several `MemoryTransport`s created
//! from one `MemoryBroker` behave like separate processes sharing a broker.
//! The broker exposes failure injection (refused connects, failed
//! publishes, dropped connections) for resilience tests.

use super::{topic_matches, Channel, Consumer, Delivery, QueueOptions, Transport};
use crate::error::{Error, Result};
use crate::types::{OutgoingMessage, ReceivedMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Bytes,
    message_id: String,
    delivery_count: u64,
    sequence: u64,
}

/// A delivered message awaiting ack, and the channel holding it
#[derive(Debug)]
struct Unacked {
    channel: u64,
    message: QueuedMessage,
}

#[derive(Default)]
struct MemoryQueue {
    exchange: String,
    bindings: HashSet<String>,
    ready: VecDeque<QueuedMessage>,
    /// Keyed by sequence
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    /// Return unacked messages held by `channel` (every channel if `None`)
    /// to the head of the queue, oldest first
    fn release(&mut self, channel: Option<u64>) -> usize {
        let sequences: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| channel.map_or(true, |c| u.channel == c))
            .map(|(seq, _)| *seq)
            .collect();

        let mut released: Vec<QueuedMessage> = sequences
            .into_iter()
            .filter_map(|seq| self.unacked.remove(&seq))
            .map(|u| u.message)
            .collect();
        released.sort_by_key(|m| std::cmp::Reverse(m.sequence));

        let count = released.len();
        for mut message in released {
            message.delivery_count += 1;
            self.ready.push_front(message);
        }
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    published: Vec<OutgoingMessage>,
    next_sequence: u64,
    next_channel: u64,
}

/// Counters exposed for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: u64,
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
}

/// Shared in-process broker state
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    generation: AtomicU64,
    online: AtomicBool,
    refuse_connects: AtomicU32,
    fail_publishes: AtomicU32,
    connects: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            generation: AtomicU64::new(0),
            online: AtomicBool::new(true),
            refuse_connects: AtomicU32::new(0),
            fail_publishes: AtomicU32::new(0),
            connects: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_next_connects(&self, n: u32) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes with a transport error, dropping the connection
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Take the broker down or bring it back; going down drops connections
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.drop_connections();
        }
    }

    /// Invalidate every open channel, as a network partition would
    ///
    /// Unacked deliveries go back to their queues.
    pub fn drop_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.release(None);
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }

    /// Every message accepted by the broker, in publish order
    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.lock().published.clone()
    }

    /// Messages waiting in a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered from a queue and not yet settled
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Routing keys bound to a queue, sorted
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connects: self.connects.load(Ordering::SeqCst),
            published: self.lock().published.len() as u64,
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Settle an unacked delivery; `requeue` puts it back for redelivery
    fn settle(&self, queue: &str, sequence: u64, channel: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Ack(format!("queue '{}' was deleted", queue)))?;

        let mut message = match q.unacked.remove(&sequence) {
            Some(held) if held.channel == channel => held.message,
            other => {
                if let Some(held) = other {
                    q.unacked.insert(sequence, held);
                }
                return Err(Error::Ack(format!(
                    "delivery {} is no longer held by this channel",
                    sequence
                )));
            }
        };
        if requeue {
            message.delivery_count += 1;
            q.ready.push_back(message);
            q.notify.notify_one();
            self.nacked.fetch_add(1, Ordering::SeqCst);
        } else {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn release_channel(&self, channel: u64) {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.release(Some(channel));
        }
    }
}

/// Transport backed by a `MemoryBroker`
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    /// Create a transport with its own private broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport connected to a shared broker
    pub fn with_broker(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        Arc::clone(&self.broker)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);

        if !self.broker.online.load(Ordering::SeqCst) {
            return Err(Error::Transport("memory broker is offline".into()));
        }
        if MemoryBroker::take_failure(&self.broker.refuse_connects) {
            return Err(Error::Transport("connection refused".into()));
        }

        let id = {
            let mut state = self.broker.lock();
            state.next_channel += 1;
            state.next_channel
        };

        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            id,
            generation: self.broker.generation.load(Ordering::SeqCst),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    id: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Transport("memory channel is closed".into()))
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.broker.online.load(Ordering::SeqCst)
            && self.broker.generation.load(Ordering::SeqCst) == self.generation
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.check_open()?;
        self.broker.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(
        &self,
        exchange: &str,
        queue: &str,
        _options: &QueueOptions,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(Error::Consumer(format!(
                "exchange '{}' not declared",
                exchange
            )));
        }
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue {
                exchange: exchange.to_string(),
                ..Default::default()
            });
        Ok(())
    }

    async fn bind(&self, _exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Consumer(format!("queue '{}' not declared", queue)))?;
        q.bindings.insert(routing_key.to_string());
        Ok(())
    }

    async fn unbind(&self, _exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        if let Some(q) = self.broker.lock().queues.get_mut(queue) {
            q.bindings.remove(routing_key);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<()> {
        self.check_open()?;
        if MemoryBroker::take_failure(&self.broker.fail_publishes) {
            self.broker.drop_connections();
            return Err(Error::Transport("connection reset during publish".into()));
        }

        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(Error::Transport(format!(
                "exchange '{}' not declared",
                exchange
            )));
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        for queue in state.queues.values_mut() {
            if queue.exchange != exchange
                || !queue
                    .bindings
                    .iter()
                    .any(|pattern| topic_matches(pattern, &message.routing_key))
            {
                continue;
            }
            queue.ready.push_back(QueuedMessage {
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                message_id: message.message_id.clone(),
                delivery_count: 1,
                sequence,
            });
            queue.notify.notify_one();
        }
        state.published.push(message);
        Ok(())
    }

    async fn consume(&self, _exchange: &str, queue: &str) -> Result<Box<dyn Consumer>> {
        self.check_open()?;
        if !self.broker.lock().queues.contains_key(queue) {
            return Err(Error::Consumer(format!("queue '{}' not declared", queue)));
        }
        Ok(Box::new(MemoryConsumer {
            broker: Arc::clone(&self.broker),
            queue: queue.to_string(),
            channel: self.id,
            generation: self.generation,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.release_channel(self.id);
        }
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<MemoryBroker>,
    queue: String,
    channel: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if self.broker.generation.load(Ordering::SeqCst) != self.generation
                || !self.broker.online.load(Ordering::SeqCst)
            {
                return Err(Error::Transport("memory connection lost".into()));
            }

            let notify = {
                let mut state = self.broker.lock();
                let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
                    Error::Consumer(format!("queue '{}' was deleted", self.queue))
                })?;
                if let Some(message) = queue.ready.pop_front() {
                    queue.unacked.insert(
                        message.sequence,
                        Unacked {
                            channel: self.channel,
                            message: message.clone(),
                        },
                    );
                    return Ok(Some(self.delivery(message)));
                }
                Arc::clone(&queue.notify)
            };
            notify.notified().await;
        }
    }
}

impl MemoryConsumer {
    fn delivery(&self, message: QueuedMessage) -> Delivery {
        let received = ReceivedMessage {
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            message_id: Some(message.message_id.clone()),
            delivery_count: message.delivery_count,
            sequence: message.sequence,
        };

        let sequence = message.sequence;
        let channel = self.channel;
        let (ack_broker, ack_queue) = (Arc::clone(&self.broker), self.queue.clone());
        let (nak_broker, nak_queue) = (Arc::clone(&self.broker), self.queue.clone());

        Delivery::new(
            received,
            move || Box::pin(async move { ack_broker.settle(&ack_queue, sequence, channel, false) }),
            move || Box::pin(async move { nak_broker.settle(&nak_queue, sequence, channel, true) }),
        )
    }
}
