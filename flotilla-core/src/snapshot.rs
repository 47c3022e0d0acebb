//! Point-in-time views of task entries, used by the run summary and the
//! query interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One failed attempt at running a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub worker_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub error: String,
}

/// Snapshot of a task entry. The description is already stringified so a
/// snapshot can always be serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub description: String,
    pub worker_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Whether the entry's result slot has been resolved (with a value or an
    /// error)
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Running,
    Completed,
    /// Has failed attempts and is not currently claimed by a worker
    Failed,
}

impl TaskSnapshot {
    pub fn status(&self) -> TaskStatus {
        match (self.start_time, self.end_time) {
            (Some(_), Some(_)) => TaskStatus::Completed,
            (Some(_), None) => TaskStatus::Running,
            (None, _) if !self.attempts.is_empty() => TaskStatus::Failed,
            (None, _) => TaskStatus::NotStarted,
        }
    }

    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
