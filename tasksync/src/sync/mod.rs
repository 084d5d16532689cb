pub mod backoff;
pub mod engine;
pub mod feed;
pub mod filter;
pub mod identity;
pub mod memory;
pub mod store;

pub use engine::{NewTask, SyncError, TaskSnapshot, TaskSync};
pub use filter::{TaskCounts, TaskView, ViewFilter};
