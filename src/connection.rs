//! Broker connection with bounded-retry reconnect
//!
//! One physical connection per process, shared by `Arc`. The first call to
//! `ensure_connected` connects lazily; a transport failure marks the
//! connection down and the next caller reconnects. Reconnection is
//! single-writer and re-runs every registered `TopologyHook`.

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::transport::{Channel, Transport};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Re-declares broker topology on every (re)connect
#[async_trait]
pub trait TopologyHook: Send + Sync {
    async fn declare(&self, channel: &dyn Channel) -> Result<()>;
}

type LostCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A shared, self-healing broker connection
pub struct BrokerConnection {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    current: RwLock<Option<Arc<dyn Channel>>>,
    reconnect_lock: Mutex<()>,
    hooks: RwLock<Vec<Arc<dyn TopologyHook>>>,
    lost_callbacks: RwLock<Vec<LostCallback>>,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            hooks: RwLock::new(Vec::new()),
            lost_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Whether an open channel is currently held
    pub fn is_connected(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Return an open channel, connecting with backoff if needed
    ///
    /// Fails with `BrokerUnavailable` once the retry budget is spent.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        let _guard = self.reconnect_lock.lock().await;
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        if self.take_current().is_some() {
            self.notify_lost("channel closed");
        }

        let max_attempts = self.retry.max_attempts().max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.try_connect().await {
                Ok(channel) => {
                    *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(Arc::clone(&channel));
                    tracing::info!(
                        transport = self.transport.name(),
                        attempt,
                        "Broker connection established"
                    );
                    return Ok(channel);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt - 1);
                        tracing::warn!(
                            transport = self.transport.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Broker connection failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(
            transport = self.transport.name(),
            attempts = max_attempts,
            error = %last_error,
            "Broker unavailable"
        );
        Err(Error::BrokerUnavailable {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Drop `failed` after a transport failure on it
    ///
    /// A no-op when `failed` is no longer the current channel, so a late
    /// error from a replaced channel never tears down its successor.
    /// Lost-connection callbacks fire once per dropped channel.
    pub async fn mark_down(&self, failed: &Arc<dyn Channel>, reason: &str) {
        let Some(channel) = self.take_if_current(failed) else {
            tracing::debug!(
                transport = self.transport.name(),
                reason,
                "Ignoring failure of a replaced channel"
            );
            return;
        };
        tracing::warn!(transport = self.transport.name(), reason, "Broker connection lost");
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Error closing dropped channel");
        }
        self.notify_lost(reason);
    }

    /// Register a callback invoked whenever the connection is lost
    pub fn on_connection_lost(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.lost_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Register topology to re-declare on every new connection
    pub fn add_topology_hook(&self, hook: Arc<dyn TopologyHook>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Close the current channel without firing lost callbacks
    pub async fn close(&self) -> Result<()> {
        match self.take_current() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    async fn try_connect(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.transport.connect().await?;
        let hooks: Vec<Arc<dyn TopologyHook>> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            if let Err(e) = hook.declare(channel.as_ref()).await {
                let _ = channel.close().await;
                return Err(e);
            }
        }
        Ok(channel)
    }

    fn open_channel(&self) -> Option<Arc<dyn Channel>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    fn take_current(&self) -> Option<Arc<dyn Channel>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_if_current(&self, failed: &Arc<dyn Channel>) -> Option<Arc<dyn Channel>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(channel) if Arc::ptr_eq(channel, failed) => current.take(),
            _ => None,
        }
    }

    fn notify_lost(&self, reason: &str) {
        for callback in self
            .lost_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(reason);
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("transport", &self.transport.name())
            .field("connected", &self.is_connected())
            .field("retry", &self.retry)
            .finish()
    }
}
