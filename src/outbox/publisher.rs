//! Background outbox publisher
//!
//! Drains pending entries on a timer, or immediately after `notify()`.
//! For each entry: claim (compare-and-set to `InProgress`), publish through
//! the bus, then record `Published` or `PublishFailed`. Publication retries
//! are unbounded; only an entry whose stored event cannot be decoded is
//! failed terminally. Shutdown is checked between entries, so an in-flight
//! publish always completes. With a retention set, the loop also purges
//! entries published longer ago than the retention after each pass.

use super::{EventOutbox, OutboxEntry};
use crate::bus::EventPublisher;
use crate::error::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counts from one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    pub failed: usize,
    /// Failed with a non-retryable error
    pub terminal: usize,
    /// Claimed by another publisher first
    pub skipped: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.published + self.failed + self.terminal
    }
}

enum EntryOutcome {
    Published,
    Failed,
    Terminal,
    Skipped,
}

pub struct OutboxPublisher {
    outbox: Arc<EventOutbox>,
    publisher: Arc<dyn EventPublisher>,
    poll_interval: Duration,
    retention: Option<Duration>,
    trigger: Notify,
}

impl OutboxPublisher {
    pub fn new(
        outbox: Arc<EventOutbox>,
        publisher: Arc<dyn EventPublisher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            outbox,
            publisher,
            poll_interval,
            retention: None,
            trigger: Notify::new(),
        }
    }

    /// Purge published entries older than `retention` after each pass
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Wake the loop for an immediate drain, e.g. right after a commit
    pub fn notify(&self) {
        self.trigger.notify_one();
    }

    /// Run one drain pass to completion
    pub async fn publish_pending(&self) -> Result<DrainReport> {
        self.drain(None).await
    }

    /// Spawn the publish loop on the current runtime
    pub fn spawn(self: Arc<Self>) -> PublisherHandle {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        PublisherHandle { shutdown, handle }
    }

    /// Publish loop; returns when `shutdown` turns true or its sender drops
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox publisher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.drain(Some(&shutdown)).await {
                Ok(report) if report.attempted() > 0 => tracing::info!(
                    published = report.published,
                    failed = report.failed,
                    terminal = report.terminal,
                    skipped = report.skipped,
                    "Outbox drained"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Outbox drain failed"),
            }

            if let Some(retention) = self.retention {
                if let Err(e) = self.outbox.purge_published(retention).await {
                    tracing::warn!(error = %e, "Outbox purge failed");
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    async fn drain(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut pending = self.outbox.drain_pending();

        while let Some(entry) = pending.next().await {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                break;
            }
            match self.publish_entry(entry?).await? {
                EntryOutcome::Published => report.published += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Terminal => report.terminal += 1,
                EntryOutcome::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    async fn publish_entry(&self, entry: OutboxEntry) -> Result<EntryOutcome> {
        let Some(claimed) = self.outbox.claim(entry.event_id).await? else {
            return Ok(EntryOutcome::Skipped);
        };

        let event = match claimed.event() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    event_id = %claimed.event_id,
                    type_name = %claimed.type_name,
                    error = %e,
                    "Stored event is undecodable, failing terminally"
                );
                self.outbox
                    .mark_failed(claimed.event_id, &e.to_string(), true)
                    .await?;
                return Ok(EntryOutcome::Terminal);
            }
        };

        match self.publisher.publish(&event).await {
            Ok(()) => {
                self.outbox.mark_published(claimed.event_id).await?;
                tracing::debug!(
                    event_id = %claimed.event_id,
                    type_name = %claimed.type_name,
                    attempts = claimed.publish_attempts,
                    "Outbox entry published"
                );
                Ok(EntryOutcome::Published)
            }
            Err(e) => {
                let terminal = !e.is_transient();
                tracing::warn!(
                    event_id = %claimed.event_id,
                    type_name = %claimed.type_name,
                    attempts = claimed.publish_attempts,
                    terminal,
                    error = %e,
                    "Outbox entry publish failed"
                );
                self.outbox
                    .mark_failed(claimed.event_id, &e.to_string(), terminal)
                    .await?;
                Ok(if terminal {
                    EntryOutcome::Terminal
                } else {
                    EntryOutcome::Failed
                })
            }
        }
    }
}

/// Handle to a spawned publish loop
pub struct PublisherHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PublisherHandle {
    /// Stop after the current publish completes
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Outbox publisher task ended abnormally");
        }
    }
}
