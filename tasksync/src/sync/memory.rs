//! In-process stand-in for the hosted backend.
//!
//! [`MemoryBackend`] is both a [`TaskStore`] and a [`ChangeFeed`]: it assigns
//! ids and timestamps the way the hosted store does, and pushes a change
//! notice to every subscriber of the affected owner after each mutation. The
//! `*_row` methods mutate directly, as another device would, without going
//! through call accounting or failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tasksync_core::{NewTaskRow, StoreError, TASKS_TABLE, Task, TaskPatch, TaskStatus};
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::{Semaphore, mpsc};

use super::feed::{ChangeEvent, ChangeFeed, ChangeOp, FeedError, FeedSubscription, event_channel};
use super::store::{RemoteError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub select: usize,
    pub insert: usize,
    pub update: usize,
    pub delete: usize,
}

impl CallCounts {
    fn bump(&mut self, op: StoreOp) {
        match op {
            StoreOp::Select => self.select += 1,
            StoreOp::Insert => self.insert += 1,
            StoreOp::Update => self.update += 1,
            StoreOp::Delete => self.delete += 1,
        }
    }
}

struct Subscriber {
    owner: String,
    tx: mpsc::Sender<ChangeEvent>,
}

struct MemoryState {
    rows: Vec<Task>,
    next_id: u64,
    clock: OffsetDateTime,
    calls: CallCounts,
    failures: HashMap<StoreOp, usize>,
    select_gates: HashMap<String, Arc<Semaphore>>,
    subscribers: Vec<Subscriber>,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                rows: Vec::new(),
                next_id: 1,
                clock: datetime!(2024-01-01 00:00 UTC),
                calls: CallCounts::default(),
                failures: HashMap::new(),
                select_gates: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Makes the next call of `op` fail with a remote error.
    pub fn fail_next(&self, op: StoreOp) {
        *self.lock().failures.entry(op).or_default() += 1;
    }

    /// Blocks `select` calls for `owner` until permits are added to the
    /// returned semaphore, one permit per call.
    pub fn hold_selects(&self, owner: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock()
            .select_gates
            .insert(owner.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn release_selects(&self, owner: &str) {
        if let Some(gate) = self.lock().select_gates.remove(owner) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Live feed subscriptions for `owner`.
    pub fn subscriber_count(&self, owner: &str) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|sub| sub.owner == owner)
            .count()
    }

    /// What a fresh `select` would return, without counting as a call.
    pub fn rows_for(&self, owner: &str) -> Vec<Task> {
        select_rows(&self.lock().rows, owner)
    }

    pub fn insert_row(&self, row: NewTaskRow) -> Result<Task, RemoteError> {
        let mut state = self.lock();
        let now = state.tick();
        let task = Task {
            id: format!("t{}", state.next_id),
            owner: row.owner,
            title: row.title,
            description: row.description,
            status: TaskStatus::Pending,
            rating: None,
            created_at: now,
            updated_at: now,
        };
        state.next_id += 1;
        state.rows.push(task.clone());
        state.notify(&task.owner, ChangeOp::Insert);
        Ok(task)
    }

    pub fn update_row(&self, id: &str, patch: &TaskPatch) -> Result<Task, RemoteError> {
        let mut state = self.lock();
        let now = state.tick();
        let task = state
            .rows
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(RemoteError::Store(StoreError::NotFound))?;
        patch.apply_to(task);
        task.updated_at = now;
        let task = task.clone();
        state.notify(&task.owner, ChangeOp::Update);
        Ok(task)
    }

    pub fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let index = state
            .rows
            .iter()
            .position(|task| task.id == id)
            .ok_or(RemoteError::Store(StoreError::NotFound))?;
        let task = state.rows.remove(index);
        state.notify(&task.owner, ChangeOp::Delete);
        Ok(())
    }

    /// Pushes a change notice to `owner`'s subscribers without touching rows.
    pub fn emit(&self, owner: &str, op: ChangeOp) {
        self.lock().notify(owner, op);
    }

    fn begin(&self, op: StoreOp) -> Result<(), RemoteError> {
        self.lock().calls.bump(op);
        self.injected_failure(op)
    }

    fn injected_failure(&self, op: StoreOp) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if let Some(pending) = state.failures.get_mut(&op)
            && *pending > 0
        {
            *pending -= 1;
            return Err(RemoteError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory backend lock poisoned")
    }
}

impl MemoryState {
    fn tick(&mut self) -> OffsetDateTime {
        self.clock += time::Duration::seconds(1);
        self.clock
    }

    fn notify(&mut self, owner: &str, op: ChangeOp) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in self.subscribers.iter().filter(|sub| sub.owner == owner) {
            // A full buffer already guarantees a pending refetch.
            let _ = sub.tx.try_send(ChangeEvent::new(op, TASKS_TABLE));
        }
    }
}

fn select_rows(rows: &[Task], owner: &str) -> Vec<Task> {
    let mut selected: Vec<Task> = rows
        .iter()
        .filter(|task| task.owner == owner)
        .cloned()
        .collect();
    selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    selected
}

#[async_trait]
impl TaskStore for MemoryBackend {
    async fn select(&self, owner: &str) -> Result<Vec<Task>, RemoteError> {
        // Counted before the gate so callers can see a held select.
        let gate = {
            let mut state = self.lock();
            state.calls.bump(StoreOp::Select);
            state.select_gates.get(owner).cloned()
        };
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| RemoteError::Unavailable("select gate closed".into()))?
                .forget();
        }
        self.injected_failure(StoreOp::Select)?;
        Ok(self.rows_for(owner))
    }

    async fn insert(&self, row: &NewTaskRow) -> Result<Task, RemoteError> {
        self.begin(StoreOp::Insert)?;
        self.insert_row(row.clone())
    }

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, RemoteError> {
        self.begin(StoreOp::Update)?;
        self.update_row(id, patch)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.begin(StoreOp::Delete)?;
        self.delete_row(id)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, table: &str, owner: &str) -> Result<FeedSubscription, FeedError> {
        if table != TASKS_TABLE {
            return Err(FeedError::UnsupportedTable(table.to_string()));
        }
        let (tx, rx) = event_channel();
        self.lock().subscribers.push(Subscriber {
            owner: owner.to_string(),
            tx,
        });
        Ok(FeedSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_row(owner: &str, title: &str) -> NewTaskRow {
        NewTaskRow {
            owner: owner.into(),
            title: title.into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn assigns_ids_and_orders_newest_first() {
        let backend = MemoryBackend::new();
        let first = backend.insert(&new_row("u1", "a")).await.unwrap();
        let second = backend.insert(&new_row("u1", "b")).await.unwrap();
        backend.insert(&new_row("u2", "c")).await.unwrap();

        assert_eq!(first.id, "t1");
        assert!(second.created_at > first.created_at);
        let ids: Vec<String> = backend
            .select("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(ids, vec!["t2", "t1"]);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let backend = MemoryBackend::new();
        let task = backend.insert(&new_row("u1", "a")).await.unwrap();
        backend.fail_next(StoreOp::Delete);

        assert!(matches!(
            backend.delete(&task.id).await,
            Err(RemoteError::Unavailable(_))
        ));
        assert_eq!(backend.rows_for("u1").len(), 1);
        backend.delete(&task.id).await.unwrap();
        assert!(backend.rows_for("u1").is_empty());
        assert_eq!(backend.calls().delete, 2);
    }

    #[tokio::test]
    async fn update_bumps_updated_at_only() {
        let backend = MemoryBackend::new();
        let task = backend.insert(&new_row("u1", "a")).await.unwrap();
        let updated = backend
            .update(&task.id, &TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(updated.created_at, task.created_at);
        assert!(updated.updated_at > task.updated_at);
        assert!(backend.update("t99", &TaskPatch::rating(1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn notifies_only_the_owner_subscribers() {
        let backend = MemoryBackend::new();
        let mut u1 = backend.subscribe(TASKS_TABLE, "u1").await.unwrap();
        let mut u2 = backend.subscribe(TASKS_TABLE, "u2").await.unwrap();

        backend.insert_row(new_row("u1", "a")).unwrap();

        assert_eq!(u1.next().await.map(|e| e.op), Some(ChangeOp::Insert));
        assert_eq!(u2.drain(), 0);
        assert_eq!(backend.subscriber_count("u1"), 1);
        u1.unsubscribe();
        assert_eq!(backend.subscriber_count("u1"), 0);
    }
}
