use std::fmt;
use std::str::FromStr;

use tasksync_core::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ViewFilter {
    #[default]
    All,
    Pending,
    Completed,
}

impl ViewFilter {
    pub const VARIANTS: [ViewFilter; 3] =
        [ViewFilter::All, ViewFilter::Pending, ViewFilter::Completed];

    pub fn matches(self, task: &Task) -> bool {
        match self {
            ViewFilter::All => true,
            ViewFilter::Pending => task.status == TaskStatus::Pending,
            ViewFilter::Completed => task.status == TaskStatus::Completed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViewFilter::All => "all",
            ViewFilter::Pending => "pending",
            ViewFilter::Completed => "completed",
        }
    }
}

impl fmt::Display for ViewFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(ViewFilter::All),
            "pending" => Ok(ViewFilter::Pending),
            "completed" | "done" => Ok(ViewFilter::Completed),
            other => Err(format!("unknown filter: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub all: usize,
    pub pending: usize,
    pub completed: usize,
}

impl TaskCounts {
    pub fn tally(tasks: &[Task]) -> Self {
        let completed = tasks.iter().filter(|task| task.is_completed()).count();
        Self {
            all: tasks.len(),
            pending: tasks.len() - completed,
            completed,
        }
    }

    pub fn get(&self, filter: ViewFilter) -> usize {
        match filter {
            ViewFilter::All => self.all,
            ViewFilter::Pending => self.pending,
            ViewFilter::Completed => self.completed,
        }
    }
}

/// What a list screen renders: the filtered tasks in collection order plus
/// per-filter counts over the whole collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskView {
    pub filter: ViewFilter,
    pub tasks: Vec<Task>,
    pub counts: TaskCounts,
    pub loading: bool,
}

pub fn filter_tasks(tasks: &[Task], filter: ViewFilter) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| filter.matches(task))
        .cloned()
        .collect()
}

pub fn project(tasks: &[Task], filter: ViewFilter, loading: bool) -> TaskView {
    TaskView {
        filter,
        tasks: filter_tasks(tasks, filter),
        counts: TaskCounts::tally(tasks),
        loading,
    }
}
