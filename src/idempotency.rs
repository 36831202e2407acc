//! Idempotent command execution
//!
//! A command tagged with a request id applies its side effects at most
//! once. The guard records a `ProcessedRequestRecord` in the same
//! transaction as the command's own writes; a repeated request id returns
//! the stored result without running the command again.
//!
//! Same-id callers in one process are serialized by a keyed lock. Across
//! processes the store's uniqueness constraint decides: the loser's commit
//! fails with `ConcurrentDuplicateInsert`, its writes are discarded, and it
//! returns the winner's result.

use crate::error::{Error, Result};
use crate::store::{Store, Transaction, Write};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::Mutex;

/// Proof that a request id was processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRequestRecord {
    pub request_id: String,
    pub command_name: String,
    pub processed_at: DateTime<Utc>,

    /// Serialized command result, replayed to duplicate callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ProcessedRequestRecord {
    pub fn new(
        request_id: impl Into<String>,
        command_name: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            command_name: command_name.into(),
            processed_at: Utc::now(),
            result,
        }
    }
}

/// Whether a guarded call ran the operation or replayed a stored result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution<R> {
    Executed(R),
    Duplicate(R),
}

impl<R> Execution<R> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Execution::Duplicate(_))
    }

    pub fn into_inner(self) -> R {
        match self {
            Execution::Executed(r) | Execution::Duplicate(r) => r,
        }
    }
}

/// A command with a stable name and a serializable result
pub trait Command: Send + 'static {
    const NAME: &'static str;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Executes a command's side effects inside the given transaction
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C, tx: Transaction) -> Result<C::Output>;
}

/// A command paired with the request id that makes it idempotent
#[derive(Debug, Clone)]
pub struct IdentifiedCommand<C> {
    pub request_id: String,
    pub command: C,
}

impl<C: Command> IdentifiedCommand<C> {
    pub fn new(request_id: impl Into<String>, command: C) -> Self {
        Self {
            request_id: request_id.into(),
            command,
        }
    }
}

pub struct IdempotencyGuard {
    store: Arc<dyn Store>,
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` at most once for `request_id`
    ///
    /// Returns the operation's result, or the stored result of the earlier
    /// execution. An operation error propagates and leaves nothing behind.
    pub async fn execute<R, F, Fut>(
        &self,
        request_id: &str,
        command_name: &str,
        operation: F,
    ) -> Result<R>
    where
        R: Serialize + DeserializeOwned + Send,
        F: FnOnce(Transaction) -> Fut + Send,
        Fut: Future<Output = Result<R>> + Send,
    {
        Ok(self
            .execute_detailed(request_id, command_name, operation)
            .await?
            .into_inner())
    }

    /// Like [`execute`](Self::execute), reporting whether the call was a duplicate
    pub async fn execute_detailed<R, F, Fut>(
        &self,
        request_id: &str,
        command_name: &str,
        operation: F,
    ) -> Result<Execution<R>>
    where
        R: Serialize + DeserializeOwned + Send,
        F: FnOnce(Transaction) -> Fut + Send,
        Fut: Future<Output = Result<R>> + Send,
    {
        if request_id.trim().is_empty() {
            return Err(Error::InvalidRequestId(request_id.to_string()));
        }

        let lock = self.lock_for(request_id);
        let _guard = lock.lock().await;

        if let Some(record) = self.store.find_request(request_id).await? {
            tracing::debug!(
                request_id,
                command = command_name,
                "Duplicate request, replaying stored result"
            );
            return Ok(Execution::Duplicate(stored_result(&record)?));
        }

        let tx = Transaction::new();
        let result = operation(tx.clone()).await?;
        tx.push(Write::ProcessedRequest(ProcessedRequestRecord::new(
            request_id,
            command_name,
            Some(serde_json::to_value(&result)?),
        )));

        match self.store.commit(tx).await {
            Ok(()) => {
                tracing::debug!(request_id, command = command_name, "Request processed");
                Ok(Execution::Executed(result))
            }
            Err(Error::ConcurrentDuplicateInsert { .. }) => {
                tracing::warn!(
                    request_id,
                    command = command_name,
                    "Lost request id race, discarding side effects"
                );
                let record = self.store.find_request(request_id).await?.ok_or_else(|| {
                    Error::Storage(format!("Processed request '{}' vanished", request_id))
                })?;
                Ok(Execution::Duplicate(stored_result(&record)?))
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatch an identified command through its handler
    pub async fn send<C, H>(&self, handler: &H, identified: IdentifiedCommand<C>) -> Result<C::Output>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let IdentifiedCommand {
            request_id,
            command,
        } = identified;
        self.execute(&request_id, C::NAME, move |tx| handler.handle(command, tx))
            .await
    }

    /// Whether a request id has already been processed
    pub async fn exists(&self, request_id: &str) -> Result<bool> {
        Ok(self.store.find_request(request_id).await?.is_some())
    }

    fn lock_for(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(request_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(request_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

fn stored_result<R: DeserializeOwned>(record: &ProcessedRequestRecord) -> Result<R> {
    Ok(serde_json::from_value(
        record.result.clone().unwrap_or(serde_json::Value::Null),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::TransactionalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn guard(store: &Arc<MemoryStore>) -> IdempotencyGuard {
        IdempotencyGuard::new(store.clone())
    }

    #[tokio::test]
    async fn test_second_call_replays_result() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(&store);
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        let first = guard
            .execute_detailed("r1", "CreateOrder", |tx| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tx.put("orders", "1", &serde_json::json!({"total": 20}))?;
                Ok(1001u64)
            })
            .await
            .unwrap();
        let second = guard
            .execute_detailed("r1", "CreateOrder", |_tx| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(2002u64)
            })
            .await
            .unwrap();

        assert_eq!(first, Execution::Executed(1001));
        assert_eq!(second, Execution::Duplicate(1001));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(guard.exists("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_leaves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(&store);

        let err = guard
            .execute::<u64, _, _>("r1", "CreateOrder", |tx| async move {
                tx.put("orders", "1", &serde_json::json!({}))?;
                Err(Error::Command {
                    command: "CreateOrder".into(),
                    reason: "empty basket".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { .. }));
        assert!(!guard.exists("r1").await.unwrap());
        assert!(store.get("orders", "1").await.unwrap().is_none());

        let retried = guard
            .execute("r1", "CreateOrder", |_tx| async { Ok(true) })
            .await
            .unwrap();
        assert!(retried);
    }

    #[tokio::test]
    async fn test_blank_request_id_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = guard(&store)
            .execute("  ", "CreateOrder", |_tx| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequestId(_)));
    }

    #[tokio::test]
    async fn test_unit_result_replays_as_null() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(&store);
        guard
            .execute("r1", "ShipOrder", |_tx| async { Ok(()) })
            .await
            .unwrap();
        let again = guard
            .execute_detailed("r1", "ShipOrder", |_tx| async { Ok(()) })
            .await
            .unwrap();
        assert!(again.is_duplicate());
    }

    #[tokio::test]
    async fn test_cross_process_race_single_effect() {
        let store = Arc::new(MemoryStore::new());
        let a = Arc::new(guard(&store));
        let b = Arc::new(guard(&store));
        let barrier = Arc::new(Barrier::new(2));

        let run = |guard: Arc<IdempotencyGuard>, value: u64| {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                guard
                    .execute("r1", "CreateOrder", move |tx| async move {
                        barrier.wait().await;
                        tx.put("effects", &value.to_string(), &value)?;
                        Ok(value)
                    })
                    .await
            })
        };

        let first = run(a, 1);
        let second = run(b, 2);
        let (first, second) = (first.await.unwrap().unwrap(), second.await.unwrap().unwrap());

        assert_eq!(first, second);
        let mut applied = 0;
        for value in [1u64, 2] {
            if store.get("effects", &value.to_string()).await.unwrap().is_some() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    struct CreateOrder {
        total: u32,
    }

    impl Command for CreateOrder {
        const NAME: &'static str = "CreateOrder";
        type Output = bool;
    }

    struct CreateOrderHandler {
        created: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler<CreateOrder> for CreateOrderHandler {
        async fn handle(&self, command: CreateOrder, tx: Transaction) -> Result<bool> {
            self.created.fetch_add(1, Ordering::SeqCst);
            tx.put("orders", "o1", &command.total)?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_identified_command_runs_once() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(&store);
        let handler = CreateOrderHandler {
            created: AtomicUsize::new(0),
        };

        for _ in 0..3 {
            let ok = guard
                .send(&handler, IdentifiedCommand::new("req-7", CreateOrder { total: 30 }))
                .await
                .unwrap();
            assert!(ok);
        }
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get("orders", "o1").await.unwrap(),
            Some(serde_json::json!(30))
        );
    }
}
