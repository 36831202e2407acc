//! In-memory transactional store
//!
//! One mutex guards every table, so a commit is atomic with respect to
//! every other operation. Lost on drop; for tests and single-process use.

use super::{OutboxStore, RequestStore, StoreState, Transaction, TransactionalStore};
use crate::error::Result;
use crate::idempotency::ProcessedRequestRecord;
use crate::outbox::OutboxEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox entry, oldest first
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox_entries()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn commit(&self, tx: Transaction) -> Result<()> {
        let writes = tx.take();
        let count = writes.len();
        self.state.lock().await.apply(writes)?;
        tracing::debug!(writes = count, "Transaction committed");
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.state.lock().await.get(table, key))
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn pending_ids(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        Ok(self.state.lock().await.pending_ids(now, lease_timeout, limit))
    }

    async fn entry(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
        Ok(self.state.lock().await.entry(event_id))
    }

    async fn claim(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<OutboxEntry>> {
        self.state.lock().await.claim(event_id, now, lease_timeout)
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<OutboxEntry> {
        self.state.lock().await.mark_published(event_id)
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        terminal: bool,
    ) -> Result<OutboxEntry> {
        self.state.lock().await.mark_failed(event_id, error, terminal)
    }

    async fn requeue_terminal(&self, event_id: Uuid) -> Result<OutboxEntry> {
        self.state.lock().await.requeue_terminal(event_id)
    }

    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.state.lock().await.purge_published(cutoff))
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn find_request(&self, request_id: &str) -> Result<Option<ProcessedRequestRecord>> {
        Ok(self.state.lock().await.find_request(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::outbox::OutboxState;
    use crate::store::Write;
    use crate::types::IntegrationEvent;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_commit_and_get() {
        let store = MemoryStore::new();
        let tx = Transaction::new();
        tx.put("orders", "42", &serde_json::json!({"status": "submitted"}))
            .unwrap();
        store.commit(tx).await.unwrap();

        let order = store.get("orders", "42").await.unwrap().unwrap();
        assert_eq!(order["status"], "submitted");
        assert!(store.get("orders", "43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing() {
        let store = MemoryStore::new();
        let record = ProcessedRequestRecord::new("r1", "CreateOrder", None);

        let tx = Transaction::new();
        tx.push(Write::ProcessedRequest(record.clone()));
        store.commit(tx).await.unwrap();

        let tx = Transaction::new();
        tx.put("orders", "1", &serde_json::json!({})).unwrap();
        tx.push(Write::ProcessedRequest(record));
        let err = store.commit(tx).await.unwrap_err();

        assert!(matches!(err, Error::ConcurrentDuplicateInsert { .. }));
        assert!(store.get("orders", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({}));
        let tx = Transaction::new();
        tx.push(Write::Outbox(OutboxEntry::new(&event).unwrap()));
        store.commit(tx).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = event.id();
            tasks.push(tokio::spawn(async move {
                store.claim(id, Utc::now(), Duration::from_secs(60)).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let entry = store.entry(event.id()).await.unwrap().unwrap();
        assert_eq!(entry.state, OutboxState::InProgress);
        assert_eq!(entry.publish_attempts, 1);
    }
}
