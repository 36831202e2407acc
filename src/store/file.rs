//! JSON file-backed transactional store
//!
//! Same semantics as `MemoryStore`, plus a snapshot written after every
//! commit and outbox transition. Writes go to a temp file that is renamed
//! over the snapshot, so a crash leaves either the old or the new state.
//! A change is visible in memory only after its snapshot is on disk.

use super::{OutboxStore, RequestStore, StoreState, Transaction, TransactionalStore};
use crate::error::{Error, Result};
use crate::idempotency::ProcessedRequestRecord;
use crate::outbox::OutboxEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open the store at `path`, loading an existing snapshot
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Storage(format!(
                    "Failed to parse store file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read store file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::debug!(
            path = %path.display(),
            outbox = state.outbox_len(),
            requests = state.requests.len(),
            "Store loaded"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, persist it, then publish it
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Storage(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(&tmp_path, json).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to write store file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to rename store file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for FileStore {
    async fn commit(&self, tx: Transaction) -> Result<()> {
        let writes = tx.take();
        let count = writes.len();
        self.mutate(|state| state.apply(writes)).await?;
        tracing::debug!(path = %self.path.display(), writes = count, "Transaction committed");
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.state.lock().await.get(table, key))
    }
}

#[async_trait]
impl OutboxStore for FileStore {
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
        self.mutate(|state| state.claim(event_id, now, lease_timeout))
            .await
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<OutboxEntry> {
        self.mutate(|state| state.mark_published(event_id)).await
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        terminal: bool,
    ) -> Result<OutboxEntry> {
        self.mutate(|state| state.mark_failed(event_id, error, terminal))
            .await
    }

    async fn requeue_terminal(&self, event_id: Uuid) -> Result<OutboxEntry> {
        self.mutate(|state| state.requeue_terminal(event_id)).await
    }

    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        {
            let state = self.state.lock().await;
            if state.outbox_len() == 0 {
                return Ok(0);
            }
        }
        self.mutate(|state| Ok(state.purge_published(cutoff))).await
    }
}

#[async_trait]
impl RequestStore for FileStore {
    async fn find_request(&self, request_id: &str) -> Result<Option<ProcessedRequestRecord>> {
        Ok(self.state.lock().await.find_request(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxState;
    use crate::store::Write;
    use crate::types::IntegrationEvent;

    #[tokio::test]
    async fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.json")).await.unwrap();
        assert!(store
            .pending_ids(Utc::now(), Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({"orderId": 3}));

        {
            let store = FileStore::open(&path).await.unwrap();
            let tx = Transaction::new();
            tx.put("orders", "3", &serde_json::json!({"status": "submitted"}))
                .unwrap();
            tx.push(Write::Outbox(OutboxEntry::new(&event).unwrap()));
            tx.push(Write::ProcessedRequest(ProcessedRequestRecord::new(
                "r1",
                "CreateOrder",
                Some(serde_json::json!(true)),
            )));
            store.commit(tx).await.unwrap();
            store
                .claim(event.id(), Utc::now(), Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let entry = reopened.entry(event.id()).await.unwrap().unwrap();
        assert_eq!(entry.state, OutboxState::InProgress);
        assert_eq!(entry.publish_attempts, 1);
        assert!(reopened.find_request("r1").await.unwrap().is_some());
        assert_eq!(
            reopened.get("orders", "3").await.unwrap().unwrap()["status"],
            "submitted"
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_purge_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({}));

        {
            let store = FileStore::open(&path).await.unwrap();
            let tx = Transaction::new();
            tx.push(Write::Outbox(OutboxEntry::new(&event).unwrap()));
            store.commit(tx).await.unwrap();
            store
                .claim(event.id(), Utc::now(), Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            store.mark_published(event.id()).await.unwrap();

            let cutoff = Utc::now() + chrono::Duration::seconds(1);
            assert_eq!(store.purge_published(cutoff).await.unwrap(), 1);
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert!(reopened.entry(event.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_rejected_commit_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path).await.unwrap();

        let record = ProcessedRequestRecord::new("r1", "CreateOrder", None);
        let tx = Transaction::new();
        tx.push(Write::ProcessedRequest(record.clone()));
        store.commit(tx).await.unwrap();

        let tx = Transaction::new();
        tx.put("orders", "9", &serde_json::json!({})).unwrap();
        tx.push(Write::ProcessedRequest(record));
        assert!(store.commit(tx).await.is_err());

        let reopened = FileStore::open(&path).await.unwrap();
        assert!(reopened.get("orders", "9").await.unwrap().is_none());
    }
}
