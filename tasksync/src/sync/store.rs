use std::sync::Arc;

use async_trait::async_trait;
use tasksync_core::{
    NewTaskRow, Order, Query, StoreClient, StoreError, TASKS_TABLE, Task, TaskPatch,
};
use thiserror::Error;

use crate::session::{AuthSession, SessionError};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no usable session: {0}")]
    Session(#[from] SessionError),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Store(StoreError::NotFound))
    }
}

/// Row operations the engine needs from the remote store.
///
/// `select` returns every task of `owner`, newest `created_at` first.
/// Mutations return the affected row as the store recorded it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn select(&self, owner: &str) -> Result<Vec<Task>, RemoteError>;
    async fn insert(&self, row: &NewTaskRow) -> Result<Task, RemoteError>;
    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, RemoteError>;
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}

/// [`TaskStore`] over the hosted row API, authorized by the live session.
pub struct RestStore {
    client: StoreClient,
    session: Arc<AuthSession>,
}

impl RestStore {
    pub fn new(client: StoreClient, session: Arc<AuthSession>) -> Self {
        Self { client, session }
    }
}

#[async_trait]
impl TaskStore for RestStore {
    async fn select(&self, owner: &str) -> Result<Vec<Task>, RemoteError> {
        let token = self.session.access_token().await?;
        let query = Query::new()
            .eq("user_id", owner)
            .order("created_at", Order::Descending);
        Ok(self.client.select(&token, TASKS_TABLE, &query).await?)
    }

    async fn insert(&self, row: &NewTaskRow) -> Result<Task, RemoteError> {
        let token = self.session.access_token().await?;
        Ok(self.client.insert(&token, TASKS_TABLE, row).await?)
    }

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, RemoteError> {
        let token = self.session.access_token().await?;
        Ok(self.client.update(&token, TASKS_TABLE, id, patch).await?)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let token = self.session.access_token().await?;
        Ok(self.client.delete(&token, TASKS_TABLE, id).await?)
    }
}
