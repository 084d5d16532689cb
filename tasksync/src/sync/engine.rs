//! Client-side task synchronization.
//!
//! [`TaskSync`] keeps one owner's task list in memory and consistent with the
//! remote store:
//!
//! - setting the owner replaces the list wholesale from a fresh fetch and
//!   opens a change-feed subscription for that owner;
//! - create, update and delete go to the store first and patch the list from
//!   the row the store returns, never from the caller's input;
//! - every change notice triggers a full refetch. Notice payloads are never
//!   merged, since they may be partial or race the engine's own patches.
//!
//! Each owner change starts a new generation. Fetch results, change notices
//! and mutation responses that belong to an older generation are dropped, so
//! a late response can never leak one owner's rows into another's list.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tasksync_core::{NewTaskRow, TASKS_TABLE, Task, TaskPatch};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::feed::{ChangeFeed, FeedSubscription};
use super::filter::{self, TaskView, ViewFilter};
use super::identity::IdentityProvider;
use super::store::{RemoteError, TaskStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no authenticated user")]
    Unauthenticated,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("remote failure: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
}

impl NewTask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub owner: Option<String>,
    pub tasks: Vec<Task>,
    pub loading: bool,
    pub filter: ViewFilter,
}

impl TaskSnapshot {
    pub fn view(&self) -> TaskView {
        filter::project(&self.tasks, self.filter, self.loading)
    }
}

struct ActiveSubscription {
    owner: String,
    listener: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct SyncState {
    owner: Option<String>,
    generation: u64,
    tasks: Vec<Task>,
    loading: bool,
    in_flight: usize,
    next_ticket: u64,
    applied_ticket: u64,
    filter: ViewFilter,
    subscription: Option<ActiveSubscription>,
}

impl SyncState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    feed: Arc<dyn ChangeFeed>,
    state: Mutex<SyncState>,
    version: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("sync state lock poisoned")
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Cheap to clone; clones share one task list.
#[derive(Clone)]
pub struct TaskSync {
    inner: Arc<Inner>,
}

impl TaskSync {
    pub fn new(store: Arc<dyn TaskStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                feed,
                state: Mutex::new(SyncState {
                    owner: None,
                    generation: 0,
                    tasks: Vec::new(),
                    // Nothing is known until the first owner is set.
                    loading: true,
                    in_flight: 0,
                    next_ticket: 0,
                    applied_ticket: 0,
                    filter: ViewFilter::default(),
                    subscription: None,
                }),
                version,
            }),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.inner.lock();
        TaskSnapshot {
            owner: state.owner.clone(),
            tasks: state.tasks.clone(),
            loading: state.loading,
            filter: state.filter,
        }
    }

    pub fn view(&self) -> TaskView {
        let state = self.inner.lock();
        filter::project(&state.tasks, state.filter, state.loading)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().tasks.clone()
    }

    pub fn find(&self, id: &str) -> Option<Task> {
        self.inner
            .lock()
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.lock().owner.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.lock().loading
    }

    pub fn subscribed_owner(&self) -> Option<String> {
        self.inner
            .lock()
            .subscription
            .as_ref()
            .map(|sub| sub.owner.clone())
    }

    pub fn filter(&self) -> ViewFilter {
        self.inner.lock().filter
    }

    pub fn set_filter(&self, filter: ViewFilter) {
        let changed = {
            let mut state = self.inner.lock();
            let changed = state.filter != filter;
            state.filter = filter;
            changed
        };
        if changed {
            self.inner.bump();
        }
    }

    /// Version counter bumped on every observable state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Switches the list to `owner`. A different owner clears the list,
    /// replaces the change-feed subscription and fetches; the same owner only
    /// refetches. `None` clears everything without touching the network.
    pub async fn set_owner(&self, owner: Option<String>) {
        let Some(owner) = owner else {
            self.clear_owner();
            return;
        };

        let (generation, switched, needs_subscription, previous) = {
            let mut state = self.inner.lock();
            if state.owner.as_deref() == Some(owner.as_str()) {
                (state.generation, false, state.subscription.is_none(), None)
            } else {
                state.generation += 1;
                state.owner = Some(owner.clone());
                state.tasks.clear();
                state.loading = true;
                state.in_flight = 0;
                state.applied_ticket = 0;
                (state.generation, true, true, state.subscription.take())
            }
        };
        if switched {
            tracing::info!(owner = %owner, "switching owner");
            drop(previous);
            self.inner.bump();
        }

        if needs_subscription {
            self.subscribe(&owner, generation).await;
        }
        self.fetch(&owner, generation).await;
    }

    /// Refetches the current owner's list. No-op without an owner.
    pub async fn refresh(&self) {
        let current = {
            let state = self.inner.lock();
            state
                .owner
                .clone()
                .map(|owner| (owner, state.generation))
        };
        if let Some((owner, generation)) = current {
            self.fetch(&owner, generation).await;
        }
    }

    /// Keeps the owner in step with `provider` until its change stream closes.
    pub fn follow<P>(&self, provider: &P) -> JoinHandle<()>
    where
        P: IdentityProvider + ?Sized,
    {
        let mut changes = provider.changes();
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let owner = changes
                    .borrow_and_update()
                    .as_ref()
                    .map(|identity| identity.id.clone());
                engine.set_owner(owner).await;
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn create(&self, input: NewTask) -> Result<Task, SyncError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(SyncError::Invalid("title must not be empty".into()));
        }
        let (owner, generation) = self.current_owner().ok_or(SyncError::Unauthenticated)?;
        let row = NewTaskRow {
            owner: owner.clone(),
            title: title.to_string(),
            description: input.description,
        };

        let created = self
            .inner
            .store
            .insert(&row)
            .await
            .inspect_err(|err| tracing::warn!(owner = %owner, error = %err, "create failed"))?;

        self.apply(generation, |tasks| {
            if created.owner != owner {
                tracing::warn!(task_id = %created.id, "created row belongs to another owner");
                return false;
            }
            // A change notice may have fetched the row already.
            match tasks.iter_mut().find(|task| task.id == created.id) {
                Some(slot) => *slot = created.clone(),
                None => tasks.insert(0, created.clone()),
            }
            true
        });
        tracing::debug!(owner = %owner, task_id = %created.id, "task created");
        Ok(created)
    }

    /// Sends `patch` for `id` and substitutes the returned row in place.
    /// Returns `Ok(None)` when the row no longer exists remotely.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>, SyncError> {
        let patch = validate_patch(patch)?;
        let (owner, generation) = self.current_owner().ok_or(SyncError::Unauthenticated)?;

        let updated = match self.inner.store.update(id, &patch).await {
            Ok(task) => task,
            Err(err) if err.is_not_found() => {
                tracing::debug!(owner = %owner, task_id = id, "update target no longer exists");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(owner = %owner, task_id = id, error = %err, "update failed");
                return Err(err.into());
            }
        };

        self.apply(generation, |tasks| {
            match tasks.iter_mut().find(|task| task.id == updated.id) {
                Some(slot) => {
                    *slot = updated.clone();
                    true
                }
                None => false,
            }
        });
        Ok(Some(updated))
    }

    /// Removes `id` locally only once the store confirmed the delete.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let (owner, generation) = self.current_owner().ok_or(SyncError::Unauthenticated)?;

        match self.inner.store.delete(id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(owner = %owner, task_id = id, "delete target already gone");
            }
            Err(err) => {
                tracing::warn!(owner = %owner, task_id = id, error = %err, "delete failed");
                return Err(err.into());
            }
        }

        self.apply(generation, |tasks| {
            let before = tasks.len();
            tasks.retain(|task| task.id != id);
            tasks.len() != before
        });
        Ok(())
    }

    /// Flips pending/completed for a task in the current list.
    pub async fn toggle_status(&self, id: &str) -> Result<Option<Task>, SyncError> {
        if self.current_owner().is_none() {
            return Err(SyncError::Unauthenticated);
        }
        let Some(task) = self.find(id) else {
            return Ok(None);
        };
        self.update(id, TaskPatch::status(task.status.toggled()))
            .await
    }

    fn current_owner(&self) -> Option<(String, u64)> {
        let state = self.inner.lock();
        state
            .owner
            .clone()
            .map(|owner| (owner, state.generation))
    }

    fn clear_owner(&self) {
        let previous = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.owner = None;
            state.tasks.clear();
            state.loading = false;
            state.in_flight = 0;
            state.applied_ticket = 0;
            state.subscription.take()
        };
        if let Some(previous) = &previous {
            tracing::info!(owner = %previous.owner, "owner cleared");
        }
        drop(previous);
        self.inner.bump();
    }

    async fn subscribe(&self, owner: &str, generation: u64) {
        let subscription = match self.inner.feed.subscribe(TASKS_TABLE, owner).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(owner, error = %err, "change feed subscription failed");
                return;
            }
        };
        let listener = tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            owner.to_string(),
            generation,
            subscription,
        ));
        let active = ActiveSubscription {
            owner: owner.to_string(),
            listener,
        };

        let surplus = {
            let mut state = self.inner.lock();
            if state.is_current(generation) && state.subscription.is_none() {
                state.subscription = Some(active);
                None
            } else {
                Some(active)
            }
        };
        if surplus.is_some() {
            tracing::debug!(owner, "dropping surplus subscription");
        }
    }

    async fn fetch(&self, owner: &str, generation: u64) {
        let ticket = {
            let mut state = self.inner.lock();
            if !state.is_current(generation) {
                return;
            }
            state.next_ticket += 1;
            state.in_flight += 1;
            state.loading = true;
            state.next_ticket
        };
        self.inner.bump();
        let pending = PendingFetch {
            inner: &self.inner,
            generation,
            settled: false,
        };

        let result = self.inner.store.select(owner).await;

        {
            let mut state = self.inner.lock();
            pending.settle(&mut state);
            if !state.is_current(generation) {
                tracing::debug!(owner, "discarding fetch for previous owner");
                return;
            }
            match result {
                Ok(tasks) if ticket > state.applied_ticket => {
                    let fetched = tasks.len();
                    state.applied_ticket = ticket;
                    state.tasks = tasks.into_iter().filter(|t| t.owner == owner).collect();
                    if state.tasks.len() != fetched {
                        tracing::warn!(
                            owner,
                            dropped = fetched - state.tasks.len(),
                            "fetch returned rows of another owner"
                        );
                    }
                    tracing::debug!(owner, count = state.tasks.len(), "list reconciled");
                }
                Ok(_) => tracing::debug!(owner, ticket, "fetch superseded by a newer one"),
                Err(err) => {
                    tracing::warn!(owner, error = %err, "fetch failed, keeping previous list");
                }
            }
        }
        self.inner.bump();
    }

    fn apply(&self, generation: u64, patch: impl FnOnce(&mut Vec<Task>) -> bool) -> bool {
        let changed = {
            let mut state = self.inner.lock();
            if !state.is_current(generation) {
                tracing::debug!("dropping local patch for previous owner");
                return false;
            }
            patch(&mut state.tasks)
        };
        if changed {
            self.inner.bump();
        }
        changed
    }
}

/// Counts one `select` as in flight. Settled on completion; if the fetch
/// future is dropped first, `Drop` releases the count instead.
struct PendingFetch<'a> {
    inner: &'a Inner,
    generation: u64,
    settled: bool,
}

impl PendingFetch<'_> {
    fn settle(mut self, state: &mut SyncState) {
        self.settled = true;
        if state.is_current(self.generation) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.loading = state.in_flight > 0;
        }
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let released = {
            let mut state = self.inner.lock();
            if state.is_current(self.generation) {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.loading = state.in_flight > 0;
                true
            } else {
                false
            }
        };
        if released {
            tracing::debug!("fetch cancelled before completion");
            self.inner.bump();
        }
    }
}

async fn listen(
    inner: Weak<Inner>,
    owner: String,
    generation: u64,
    mut subscription: FeedSubscription,
) {
    while let Some(event) = subscription.next().await {
        // One refetch covers every notice queued behind this one.
        let coalesced = subscription.drain();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = TaskSync { inner };
        if !engine.inner.lock().is_current(generation) {
            tracing::debug!(owner = %owner, "ignoring change notice for previous owner");
            break;
        }
        tracing::debug!(owner = %owner, op = ?event.op, coalesced, "change notice, refetching");
        engine.fetch(&owner, generation).await;
    }
}

fn validate_patch(mut patch: TaskPatch) -> Result<TaskPatch, SyncError> {
    if patch.is_empty() {
        return Err(SyncError::Invalid("nothing to update".into()));
    }
    if let Some(title) = &mut patch.title {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Invalid("title must not be empty".into()));
        }
        *title = trimmed.to_string();
    }
    if let Some(Some(rating)) = patch.rating
        && !(1..=5).contains(&rating)
    {
        return Err(SyncError::Invalid(format!(
            "rating must be between 1 and 5, got {rating}"
        )));
    }
    Ok(patch)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
