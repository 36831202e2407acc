//! Transactional outbox
//!
//! Integration events are written to the outbox inside the same
//! `Transaction` as the business change that produced them, then drained
//! to the broker by a background [`OutboxPublisher`]. Nothing reaches the
//! broker before its entry is durably committed.
//!
//! State machine:
//!
//! ```text
//! Created ──▶ InProgress ──▶ Published
//!                 ▲    │
//!                 │    ▼
//!                 PublishFailed
//! ```
//!
//! An `InProgress` entry whose lease expired is claimable again; a
//! terminal `PublishFailed` entry stays out of the drain set until an
//! operator requeues it.

mod publisher;

pub use publisher::{DrainReport, OutboxPublisher, PublisherHandle};

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::store::{OutboxStore, Transaction, Write};
use crate::types::IntegrationEvent;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Publication state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboxState {
    Created,
    InProgress,
    Published,
    PublishFailed,
}

impl OutboxState {
    /// Whether the state machine allows `self -> to`
    ///
    /// `InProgress -> InProgress` is a lease reclaim.
    pub fn can_transition(self, to: OutboxState) -> bool {
        use OutboxState::*;
        matches!(
            (self, to),
            (Created, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Published)
                | (InProgress, PublishFailed)
                | (PublishFailed, InProgress)
        )
    }
}

/// One event awaiting (or done with) publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub event_id: Uuid,
    pub type_name: String,

    /// JSON of the whole `IntegrationEvent`
    pub serialized_payload: String,

    pub state: OutboxState,
    pub created_at: DateTime<Utc>,

    /// Incremented on every transition to `InProgress`
    pub publish_attempts: u32,

    /// Start of the current publish lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Failed permanently; excluded from draining until requeued
    #[serde(default)]
    pub terminal: bool,
}

impl OutboxEntry {
    pub fn new(event: &IntegrationEvent) -> Result<Self> {
        Ok(Self {
            event_id: event.id(),
            type_name: event.type_name().to_string(),
            serialized_payload: serde_json::to_string(event)?,
            state: OutboxState::Created,
            created_at: Utc::now(),
            publish_attempts: 0,
            claimed_at: None,
            last_error: None,
            published_at: None,
            terminal: false,
        })
    }

    /// Reconstruct the stored event
    pub fn event(&self) -> Result<IntegrationEvent> {
        Ok(serde_json::from_str(&self.serialized_payload)?)
    }

    /// Whether a publisher may claim this entry at `now`
    pub fn is_pending(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        match self.state {
            OutboxState::Created => true,
            OutboxState::PublishFailed => !self.terminal,
            OutboxState::InProgress => self
                .claimed_at
                .and_then(|claimed| now.signed_duration_since(claimed).to_std().ok())
                .map(|elapsed| elapsed >= lease_timeout)
                .unwrap_or(true),
            OutboxState::Published => false,
        }
    }

    fn transition(&mut self, to: OutboxState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                event_id: self.event_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.terminal {
            return Err(Error::InvalidTransition {
                event_id: self.event_id,
                from: self.state,
                to: OutboxState::InProgress,
            });
        }
        self.transition(OutboxState::InProgress)?;
        self.publish_attempts += 1;
        self.claimed_at = Some(now);
        Ok(())
    }

    pub(crate) fn complete(&mut self) -> Result<()> {
        self.transition(OutboxState::Published)?;
        self.claimed_at = None;
        self.last_error = None;
        self.published_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &str, terminal: bool) -> Result<()> {
        self.transition(OutboxState::PublishFailed)?;
        self.claimed_at = None;
        self.last_error = Some(error.to_string());
        self.terminal = terminal;
        Ok(())
    }

    pub(crate) fn requeue(&mut self) -> Result<()> {
        if self.state != OutboxState::PublishFailed || !self.terminal {
            return Err(Error::InvalidTransition {
                event_id: self.event_id,
                from: self.state,
                to: OutboxState::PublishFailed,
            });
        }
        self.terminal = false;
        Ok(())
    }
}

/// Facade over an `OutboxStore`: enqueue inside business transactions,
/// drain for publication
pub struct EventOutbox {
    store: Arc<dyn OutboxStore>,
    lease_timeout: Duration,
    batch_size: usize,
}

impl EventOutbox {
    pub fn new(store: Arc<dyn OutboxStore>, config: &BusConfig) -> Self {
        Self::with_settings(store, config.outbox_lease_timeout(), config.outbox_batch_size)
    }

    pub fn with_settings(
        store: Arc<dyn OutboxStore>,
        lease_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            lease_timeout,
            batch_size: batch_size.max(1),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Append a `Created` entry for `event` to the caller's transaction
    ///
    /// Nothing is visible to the publisher until the transaction commits.
    pub fn enqueue(&self, event: &IntegrationEvent, tx: &Transaction) -> Result<()> {
        let entry = OutboxEntry::new(event)?;
        tracing::debug!(
            event_id = %entry.event_id,
            type_name = %entry.type_name,
            "Event enqueued in outbox"
        );
        tx.push(Write::Outbox(entry));
        Ok(())
    }

    /// Entries eligible for publication, oldest first
    ///
    /// The id set is snapshotted when the stream is first polled; each
    /// entry is loaded lazily and skipped if another publisher moved it
    /// meanwhile. At most `batch_size` entries per call.
    pub fn drain_pending(&self) -> BoxStream<'static, Result<OutboxEntry>> {
        enum Drain {
            Start,
            Ids(VecDeque<Uuid>),
            Done,
        }

        let store = Arc::clone(&self.store);
        let lease = self.lease_timeout;
        let limit = self.batch_size;

        stream::unfold(Drain::Start, move |state| {
            let store = Arc::clone(&store);
            async move {
                let mut ids = match state {
                    Drain::Start => match store.pending_ids(Utc::now(), lease, limit).await {
                        Ok(ids) => VecDeque::from(ids),
                        Err(e) => return Some((Err(e), Drain::Done)),
                    },
                    Drain::Ids(ids) => ids,
                    Drain::Done => return None,
                };

                while let Some(id) = ids.pop_front() {
                    match store.entry(id).await {
                        Ok(Some(entry)) if entry.is_pending(Utc::now(), lease) => {
                            return Some((Ok(entry), Drain::Ids(ids)))
                        }
                        Ok(_) => continue,
                        Err(e) => return Some((Err(e), Drain::Ids(ids))),
                    }
                }
                None
            }
        })
        .boxed()
    }

    /// Claim an entry for publication (compare-and-set)
    ///
    /// `None` when the entry is no longer pending.
    pub async fn claim(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
        self.store
            .claim(event_id, Utc::now(), self.lease_timeout)
            .await
    }

    pub async fn mark_published(&self, event_id: Uuid) -> Result<OutboxEntry> {
        self.store.mark_published(event_id).await
    }

    pub async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        terminal: bool,
    ) -> Result<OutboxEntry> {
        self.store.mark_failed(event_id, error, terminal).await
    }

    pub async fn entry(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
        self.store.entry(event_id).await
    }

    /// Delete entries published more than `older_than` ago
    pub async fn purge_published(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("Invalid outbox retention: {}", e)))?;
        let purged = self.store.purge_published(Utc::now() - age).await?;
        if purged > 0 {
            tracing::info!(purged, "Published outbox entries purged");
        }
        Ok(purged)
    }

    /// Return a terminal entry to the drain set
    pub async fn requeue_terminal(&self, event_id: Uuid) -> Result<OutboxEntry> {
        let entry = self.store.requeue_terminal(event_id).await?;
        tracing::info!(event_id = %event_id, "Terminal outbox entry requeued");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::TransactionalStore;
    use futures::TryStreamExt;

    fn event(type_name: &str) -> IntegrationEvent {
        IntegrationEvent::from_parts(type_name, serde_json::json!({"orderId": 1}))
    }

    fn outbox(store: &Arc<MemoryStore>) -> EventOutbox {
        EventOutbox::with_settings(store.clone(), Duration::from_secs(60), 100)
    }

    #[test]
    fn test_state_machine() {
        use OutboxState::*;
        assert!(Created.can_transition(InProgress));
        assert!(InProgress.can_transition(Published));
        assert!(InProgress.can_transition(PublishFailed));
        assert!(PublishFailed.can_transition(InProgress));
        assert!(!Published.can_transition(InProgress));
        assert!(!PublishFailed.can_transition(Created));
        assert!(!Created.can_transition(Published));
    }

    #[test]
    fn test_entry_transitions() {
        let mut entry = OutboxEntry::new(&event("OrderStarted")).unwrap();
        assert!(entry.complete().is_err());

        entry.begin_attempt(Utc::now()).unwrap();
        entry.fail("broker down", false).unwrap();
        entry.begin_attempt(Utc::now()).unwrap();
        entry.complete().unwrap();

        assert_eq!(entry.state, OutboxState::Published);
        assert_eq!(entry.publish_attempts, 2);
        assert!(entry.last_error.is_none());

        let err = entry.begin_attempt(Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OutboxState::Published,
                to: OutboxState::InProgress,
                ..
            }
        ));
    }

    #[test]
    fn test_lease_expiry_makes_in_progress_pending() {
        let mut entry = OutboxEntry::new(&event("OrderStarted")).unwrap();
        let claimed = Utc::now() - chrono::Duration::seconds(120);
        entry.begin_attempt(claimed).unwrap();

        assert!(!entry.is_pending(Utc::now(), Duration::from_secs(300)));
        assert!(entry.is_pending(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_terminal_failure_not_pending_until_requeued() {
        let mut entry = OutboxEntry::new(&event("OrderStarted")).unwrap();
        entry.begin_attempt(Utc::now()).unwrap();
        entry.fail("bad payload", true).unwrap();
        assert!(!entry.is_pending(Utc::now(), Duration::from_secs(60)));
        assert!(entry.begin_attempt(Utc::now()).is_err());

        entry.requeue().unwrap();
        assert_eq!(entry.state, OutboxState::PublishFailed);
        assert!(entry.is_pending(Utc::now(), Duration::from_secs(60)));
        assert!(entry.requeue().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_invisible_until_commit() {
        let store = Arc::new(MemoryStore::new());
        let outbox = outbox(&store);

        let tx = Transaction::new();
        outbox.enqueue(&event("OrderStarted"), &tx).unwrap();
        let pending: Vec<OutboxEntry> = outbox.drain_pending().try_collect().await.unwrap();
        assert!(pending.is_empty());

        store.commit(tx).await.unwrap();
        let pending: Vec<OutboxEntry> = outbox.drain_pending().try_collect().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, OutboxState::Created);
    }

    #[tokio::test]
    async fn test_drain_oldest_first_and_skips_published() {
        let store = Arc::new(MemoryStore::new());
        let outbox = outbox(&store);

        let events: Vec<IntegrationEvent> = ["A", "B", "C"].iter().map(|t| event(t)).collect();
        for e in &events {
            let tx = Transaction::new();
            outbox.enqueue(e, &tx).unwrap();
            store.commit(tx).await.unwrap();
        }

        outbox.claim(events[1].id()).await.unwrap().unwrap();
        outbox.mark_published(events[1].id()).await.unwrap();

        let pending: Vec<OutboxEntry> = outbox.drain_pending().try_collect().await.unwrap();
        let types: Vec<&str> = pending.iter().map(|e| e.type_name.as_str()).collect();
        assert_eq!(types, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let store = Arc::new(MemoryStore::new());
        let outbox = outbox(&store);
        let e = event("OrderStarted");
        let tx = Transaction::new();
        outbox.enqueue(&e, &tx).unwrap();
        store.commit(tx).await.unwrap();

        let first = outbox.claim(e.id()).await.unwrap();
        let second = outbox.claim(e.id()).await.unwrap();

        assert_eq!(first.unwrap().publish_attempts, 1);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_drain_respects_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let outbox = EventOutbox::with_settings(store.clone(), Duration::from_secs(60), 2);
        for i in 0..5 {
            let tx = Transaction::new();
            outbox.enqueue(&event(&format!("E{}", i)), &tx).unwrap();
            store.commit(tx).await.unwrap();
        }

        let pending: Vec<OutboxEntry> = outbox.drain_pending().try_collect().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].type_name, "E0");
    }
}
