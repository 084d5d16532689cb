use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tasksync_core::Task;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::backoff::PollBackoff;
use super::store::{RemoteError, TaskStore};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Notice that some row of `table` changed. Carries no row data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub table: String,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, table: impl Into<String>) -> Self {
        Self {
            op,
            table: table.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("unsupported table: {0}")]
    UnsupportedTable(String),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Live subscription. Dropping it, or calling [`unsubscribe`], releases the
/// underlying connection.
///
/// [`unsubscribe`]: FeedSubscription::unsubscribe
pub struct FeedSubscription {
    events: mpsc::Receiver<ChangeEvent>,
    _release: Option<DropGuard>,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            events,
            _release: None,
        }
    }

    /// Subscription whose producer stops when `cancel` fires.
    pub fn with_cancel(events: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            _release: Some(cancel.drop_guard()),
        }
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Discards events already queued, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn unsubscribe(self) {}
}

pub fn event_channel() -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    mpsc::channel(EVENT_BUFFER)
}

/// Push channel of change notices scoped to one owner's rows.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, table: &str, owner: &str) -> Result<FeedSubscription, FeedError>;
}

/// Change feed that polls the store and reports rows that appeared, changed
/// `updated_at` or disappeared since the previous poll.
pub struct PollingFeed {
    store: Arc<dyn TaskStore>,
    table: String,
    interval: Duration,
}

impl PollingFeed {
    pub fn new(store: Arc<dyn TaskStore>, table: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            table: table.into(),
            interval,
        }
    }
}

#[async_trait]
impl ChangeFeed for PollingFeed {
    async fn subscribe(&self, table: &str, owner: &str) -> Result<FeedSubscription, FeedError> {
        if table != self.table {
            return Err(FeedError::UnsupportedTable(table.to_string()));
        }
        let (tx, rx) = event_channel();
        let cancel = CancellationToken::new();
        let poller = Poller {
            store: Arc::clone(&self.store),
            owner: owner.to_string(),
            table: self.table.clone(),
            interval: self.interval,
            backoff: PollBackoff::new(self.interval, self.interval.saturating_mul(12), true),
        };
        tokio::spawn(poller.run(tx, cancel.clone()));
        tracing::debug!(owner, table, "polling feed subscribed");
        Ok(FeedSubscription::with_cancel(rx, cancel))
    }
}

struct Poller {
    store: Arc<dyn TaskStore>,
    owner: String,
    table: String,
    interval: Duration,
    backoff: PollBackoff,
}

impl Poller {
    async fn run(mut self, tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) {
        let mut seen: Option<HashMap<String, OffsetDateTime>> = None;
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.store.select(&self.owner).await {
                Ok(rows) => {
                    self.backoff.reset();
                    delay = self.interval;
                    let current = fingerprint(&rows);
                    if let Some(previous) = &seen {
                        for op in diff(previous, &current) {
                            if tx.send(ChangeEvent::new(op, &self.table)).await.is_err() {
                                return;
                            }
                        }
                    }
                    seen = Some(current);
                }
                Err(err) => {
                    delay = self.backoff.on_failure();
                    tracing::warn!(
                        owner = %self.owner,
                        error = %err,
                        failures = self.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "change feed poll failed"
                    );
                }
            }
        }
        tracing::debug!(owner = %self.owner, "polling feed released");
    }
}

fn fingerprint(rows: &[Task]) -> HashMap<String, OffsetDateTime> {
    rows.iter()
        .map(|task| (task.id.clone(), task.updated_at))
        .collect()
}

fn diff(
    previous: &HashMap<String, OffsetDateTime>,
    current: &HashMap<String, OffsetDateTime>,
) -> Vec<ChangeOp> {
    let mut ops = Vec::new();
    for (id, updated_at) in current {
        match previous.get(id) {
            None => ops.push(ChangeOp::Insert),
            Some(before) if before != updated_at => ops.push(ChangeOp::Update),
            Some(_) => {}
        }
    }
    ops.extend(
        previous
            .keys()
            .filter(|id| !current.contains_key(*id))
            .map(|_| ChangeOp::Delete),
    );
    ops
}
