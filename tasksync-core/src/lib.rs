mod auth;
mod client;
mod task;

pub use auth::{AuthClient, AuthError, AuthUser, SessionToken, SignUp};
pub use client::{ApiErrorClass, Order, Query, StoreClient, StoreError};
pub use task::{NewTaskRow, TASKS_TABLE, Task, TaskPatch, TaskStatus, UnknownStatus};
