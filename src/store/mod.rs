//! Transactional storage surface
//!
//! A `Transaction` collects business writes, outbox entries and processed
//! request records; `TransactionalStore::commit` applies all of them
//! atomically or none. Request ids are unique: a commit carrying a
//! request id that already exists fails with `ConcurrentDuplicateInsert`.
//!
//! Backends: [`memory::MemoryStore`] and [`file::FileStore`].

pub mod file;
pub mod memory;

use crate::error::{Error, Result};
use crate::idempotency::ProcessedRequestRecord;
use crate::outbox::{OutboxEntry, OutboxState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

pub use file::FileStore;
pub use memory::MemoryStore;

/// One buffered write
#[derive(Debug, Clone)]
pub enum Write {
    /// Upsert a business record
    Put {
        table: String,
        key: String,
        value: serde_json::Value,
    },
    /// Remove a business record
    Delete { table: String, key: String },
    /// Append an outbox entry
    Outbox(OutboxEntry),
    /// Insert a processed request record (unique on request id)
    ProcessedRequest(ProcessedRequestRecord),
}

/// Unit of work shared by domain code, the outbox and the idempotency guard
///
/// Cloning yields a handle onto the same write buffer.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    writes: Arc<Mutex<Vec<Write>>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an upsert of a business record
    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        self.push(Write::Put {
            table: table.to_string(),
            key: key.to_string(),
            value: serde_json::to_value(value)?,
        });
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &str) {
        self.push(Write::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn push(&self, write: Write) {
        self.lock().push(write);
    }

    pub(crate) fn take(&self) -> Vec<Write> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Write>> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Atomic commit of a `Transaction` plus reads of business records
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Apply every buffered write atomically
    async fn commit(&self, tx: Transaction) -> Result<()>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Outbox table operations used by the publisher
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Ids of claimable entries, oldest first, at most `limit`
    async fn pending_ids(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>>;

    async fn entry(&self, event_id: Uuid) -> Result<Option<OutboxEntry>>;

    /// Move a pending entry to `InProgress`; `None` if it is not pending
    async fn claim(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<OutboxEntry>>;

    async fn mark_published(&self, event_id: Uuid) -> Result<OutboxEntry>;

    async fn mark_failed(&self, event_id: Uuid, error: &str, terminal: bool)
        -> Result<OutboxEntry>;

    async fn requeue_terminal(&self, event_id: Uuid) -> Result<OutboxEntry>;

    /// Delete `Published` entries completed before `cutoff`; returns the count
    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Idempotency table lookups
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_request(&self, request_id: &str) -> Result<Option<ProcessedRequestRecord>>;
}

/// Everything a full backend provides
pub trait Store: TransactionalStore + OutboxStore + RequestStore {}

impl<T: TransactionalStore + OutboxStore + RequestStore> Store for T {}

/// Tables shared by the in-memory and file backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreState {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, serde_json::Value>>,

    /// Keyed by event id
    #[serde(default)]
    outbox: BTreeMap<Uuid, OutboxEntry>,

    #[serde(default)]
    requests: BTreeMap<String, ProcessedRequestRecord>,
}

impl StoreState {
    /// Validate every write, then apply all of them
    pub(crate) fn apply(&mut self, writes: Vec<Write>) -> Result<()> {
        self.validate(&writes)?;

        for write in writes {
            match write {
                Write::Put { table, key, value } => {
                    self.tables.entry(table).or_default().insert(key, value);
                }
                Write::Delete { table, key } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
                Write::Outbox(entry) => {
                    self.outbox.insert(entry.event_id, entry);
                }
                Write::ProcessedRequest(record) => {
                    self.requests.insert(record.request_id.clone(), record);
                }
            }
        }
        Ok(())
    }

    fn validate(&self, writes: &[Write]) -> Result<()> {
        let mut new_requests = HashSet::new();
        let mut new_entries = HashSet::new();
        for write in writes {
            match write {
                Write::ProcessedRequest(record) => {
                    if self.requests.contains_key(&record.request_id)
                        || !new_requests.insert(record.request_id.as_str())
                    {
                        return Err(Error::ConcurrentDuplicateInsert {
                            request_id: record.request_id.clone(),
                        });
                    }
                }
                Write::Outbox(entry) => {
                    if self.outbox.contains_key(&entry.event_id)
                        || !new_entries.insert(entry.event_id)
                    {
                        return Err(Error::Storage(format!(
                            "Duplicate outbox entry for event {}",
                            entry.event_id
                        )));
                    }
                }
                Write::Put { .. } | Write::Delete { .. } => {}
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    pub(crate) fn pending_ids(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
        limit: usize,
    ) -> Vec<Uuid> {
        let mut pending: Vec<&OutboxEntry> = self
            .outbox
            .values()
            .filter(|e| e.is_pending(now, lease_timeout))
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.event_id));
        pending.into_iter().take(limit).map(|e| e.event_id).collect()
    }

    pub(crate) fn entry(&self, event_id: Uuid) -> Option<OutboxEntry> {
        self.outbox.get(&event_id).cloned()
    }

    /// Outbox entries, oldest first
    pub(crate) fn outbox_entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<OutboxEntry> = self.outbox.values().cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.event_id));
        entries
    }

    pub(crate) fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub(crate) fn claim(
        &mut self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<OutboxEntry>> {
        let entry = self.entry_mut(event_id)?;
        if !entry.is_pending(now, lease_timeout) {
            return Ok(None);
        }
        entry.begin_attempt(now)?;
        Ok(Some(entry.clone()))
    }

    pub(crate) fn mark_published(&mut self, event_id: Uuid) -> Result<OutboxEntry> {
        let entry = self.entry_mut(event_id)?;
        entry.complete()?;
        Ok(entry.clone())
    }

    pub(crate) fn mark_failed(
        &mut self,
        event_id: Uuid,
        error: &str,
        terminal: bool,
    ) -> Result<OutboxEntry> {
        let entry = self.entry_mut(event_id)?;
        entry.fail(error, terminal)?;
        Ok(entry.clone())
    }

    pub(crate) fn requeue_terminal(&mut self, event_id: Uuid) -> Result<OutboxEntry> {
        let entry = self.entry_mut(event_id)?;
        entry.requeue()?;
        Ok(entry.clone())
    }

    pub(crate) fn purge_published(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.outbox.len();
        self.outbox.retain(|_, e| {
            e.state != OutboxState::Published
                || e.published_at.map_or(false, |published| published >= cutoff)
        });
        before - self.outbox.len()
    }

    pub(crate) fn find_request(&self, request_id: &str) -> Option<ProcessedRequestRecord> {
        self.requests.get(request_id).cloned()
    }

    fn entry_mut(&mut self, event_id: Uuid) -> Result<&mut OutboxEntry> {
        self.outbox
            .get_mut(&event_id)
            .ok_or_else(|| Error::NotFound(format!("Outbox entry {}", event_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntegrationEvent;

    fn record(request_id: &str) -> ProcessedRequestRecord {
        ProcessedRequestRecord::new(request_id, "CreateOrder", Some(serde_json::json!(true)))
    }

    #[test]
    fn test_transaction_clones_share_buffer() {
        let tx = Transaction::new();
        let handle = tx.clone();
        handle.put("orders", "1", &serde_json::json!({"total": 10})).unwrap();
        handle.delete("baskets", "u1");
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.take().len(), 2);
        assert!(handle.is_empty());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut state = StoreState::default();
        state
            .apply(vec![Write::ProcessedRequest(record("r1"))])
            .unwrap();

        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({}));
        let err = state
            .apply(vec![
                Write::Put {
                    table: "orders".into(),
                    key: "1".into(),
                    value: serde_json::json!({}),
                },
                Write::Outbox(OutboxEntry::new(&event).unwrap()),
                Write::ProcessedRequest(record("r1")),
            ])
            .unwrap_err();

        assert!(matches!(err, Error::ConcurrentDuplicateInsert { .. }));
        assert!(state.get("orders", "1").is_none());
        assert!(state.entry(event.id()).is_none());
    }

    #[test]
    fn test_duplicate_request_within_one_transaction() {
        let mut state = StoreState::default();
        let err = state
            .apply(vec![
                Write::ProcessedRequest(record("r1")),
                Write::ProcessedRequest(record("r1")),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentDuplicateInsert { .. }));
        assert!(state.find_request("r1").is_none());
    }

    #[test]
    fn test_unknown_entry_is_not_found() {
        let mut state = StoreState::default();
        assert!(matches!(
            state.mark_published(Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_purge_removes_only_old_published_entries() {
        let mut state = StoreState::default();
        let events: Vec<IntegrationEvent> = (0..3)
            .map(|i| IntegrationEvent::from_parts("OrderStarted", serde_json::json!({"i": i})))
            .collect();
        state
            .apply(
                events
                    .iter()
                    .map(|e| Write::Outbox(OutboxEntry::new(e).unwrap()))
                    .collect(),
            )
            .unwrap();

        let now = Utc::now();
        let lease = Duration::from_secs(60);
        for event in &events[..2] {
            state.claim(event.id(), now, lease).unwrap().unwrap();
        }
        state.mark_published(events[0].id()).unwrap();
        state.mark_failed(events[1].id(), "broker down", false).unwrap();

        assert_eq!(state.purge_published(now - chrono::Duration::hours(1)), 0);
        assert_eq!(state.purge_published(Utc::now() + chrono::Duration::seconds(1)), 1);

        assert!(state.entry(events[0].id()).is_none());
        assert!(state.entry(events[1].id()).is_some());
        assert!(state.entry(events[2].id()).is_some());
        assert_eq!(state.outbox_len(), 2);
        let mut pending = state.pending_ids(Utc::now(), lease, 10);
        pending.sort();
        let mut expected = vec![events[1].id(), events[2].id()];
        expected.sort();
        assert_eq!(pending, expected);
    }

    #[test]
    fn test_state_serialization_roundtrip() {
        let mut state = StoreState::default();
        let event = IntegrationEvent::from_parts("OrderStarted", serde_json::json!({"a": 1}));
        state
            .apply(vec![
                Write::Outbox(OutboxEntry::new(&event).unwrap()),
                Write::ProcessedRequest(record("r1")),
            ])
            .unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let restored: StoreState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.entry(event.id()), state.entry(event.id()));
        assert_eq!(restored.find_request("r1"), state.find_request("r1"));
    }
}
