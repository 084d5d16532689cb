use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

pub const TASKS_TABLE: &str = "todos";

/// A task row as stored remotely. Every field is authoritative server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner: String,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Completed but not yet rated.
    pub fn needs_rating(&self) -> bool {
        self.is_completed() && self.rating.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            TaskStatus::Pending => TaskStatus::Completed,
            TaskStatus::Completed => TaskStatus::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Insert body. The owner is filled in by whoever holds the session, never by
/// the caller that supplied title and description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTaskRow {
    #[serde(rename = "user_id")]
    pub owner: String,
    pub title: String,
    pub description: String,
}

/// Partial update. Absent fields are left untouched server-side.
///
/// `rating` is doubly optional: `Some(None)` clears the rating (sent as
/// `null`), `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<Option<u8>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn rating(rating: u8) -> Self {
        Self {
            rating: Some(Some(rating)),
            ..Self::default()
        }
    }

    pub fn clear_rating() -> Self {
        Self {
            rating: Some(None),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.rating.is_none()
    }

    /// Applies the patch the way the store does. `updated_at` is not touched;
    /// the store assigns it.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(rating) = self.rating {
            task.rating = rating;
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> serde_json::Value {
        json!({
            "id": "t1",
            "user_id": "u1",
            "title": "Buy milk",
            "description": null,
            "status": "pending",
            "rating": null,
            "created_at": "2024-05-01T10:00:00.123456+00:00",
            "updated_at": "2024-05-01T10:00:00.123456+00:00"
        })
    }

    #[test]
    fn task_row_maps_wire_names() {
        let task: Task = serde_json::from_value(row()).unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.owner, "u1");
        assert_eq!(task.description, "");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.rating, None);
        assert!(!task.is_completed());
        assert!(!task.needs_rating());
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let body = serde_json::to_value(TaskPatch::status(TaskStatus::Completed)).unwrap();
        assert_eq!(body, json!({ "status": "completed" }));

        let body = serde_json::to_value(TaskPatch::clear_rating()).unwrap();
        assert_eq!(body, json!({ "rating": null }));

        let body = serde_json::to_value(TaskPatch::default().with_title("Oat milk")).unwrap();
        assert_eq!(body, json!({ "title": "Oat milk" }));
    }

    #[test]
    fn patch_application_leaves_missing_fields_alone() {
        let mut task: Task = serde_json::from_value(row()).unwrap();
        TaskPatch::status(TaskStatus::Completed).apply_to(&mut task);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.rating, None);
        assert!(task.needs_rating());

        TaskPatch::rating(4).apply_to(&mut task);
        assert_eq!(task.rating, Some(4));
        assert_eq!(task.title, "Buy milk");
    }

    #[test]
    fn new_row_carries_owner_as_user_id() {
        let body = serde_json::to_value(NewTaskRow {
            owner: "u1".into(),
            title: "Buy milk".into(),
            description: String::new(),
        })
        .unwrap();
        assert_eq!(
            body,
            json!({ "user_id": "u1", "title": "Buy milk", "description": "" })
        );
    }

    #[test]
    fn status_parses_and_toggles() {
        assert_eq!("Completed".parse::<TaskStatus>(), Ok(TaskStatus::Completed));
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::Pending.toggled(), TaskStatus::Completed);
    }
}
