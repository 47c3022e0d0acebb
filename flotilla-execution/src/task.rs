//! Task invocations and their outcomes
//!
//! A task is a named operation applied to one JSON input. Invocations and
//! outcomes are plain data, so they can be sent to a worker in another
//! process.

use flotilla_core::{RunError, TaskError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Result of one task as seen by the caller of `map`
pub type TaskResult = Result<JsonValue, RunError>;

/// One unit of work: run `operation` on `input`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub operation: String,
    pub input: JsonValue,
}

impl TaskInvocation {
    pub fn new(operation: impl Into<String>, input: JsonValue) -> Self {
        Self {
            operation: operation.into(),
            input,
        }
    }

    /// Text shown for this task in run summaries and listings
    pub fn description(&self) -> String {
        self.input.to_string()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Outcome of a task run on a remote worker, as sent back over RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { value: JsonValue },
    Failed { error: TaskError },
}

impl TaskOutcome {
    pub fn into_result(self) -> Result<JsonValue, TaskError> {
        match self {
            TaskOutcome::Succeeded { value } => Ok(value),
            TaskOutcome::Failed { error } => Err(error),
        }
    }
}

impl From<Result<JsonValue, TaskError>> for TaskOutcome {
    fn from(result: Result<JsonValue, TaskError>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Succeeded { value },
            Err(error) => TaskOutcome::Failed { error },
        }
    }
}

/// Short label for a task description: the `name` field of an object
/// input, the text of a string input, or the description itself.
pub fn job_label(description: &str) -> String {
    match serde_json::from_str::<JsonValue>(description) {
        Ok(JsonValue::String(s)) => s,
        Ok(JsonValue::Object(map)) => match map.get("name") {
            Some(JsonValue::String(name)) => name.clone(),
            _ => description.to_string(),
        },
        _ => description.to_string(),
    }
}
