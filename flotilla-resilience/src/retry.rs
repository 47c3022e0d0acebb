//! Requeue-based retry policy
//!
//! Failed tasks are retried by putting them back on the task queue. There is
//! no delay between attempts: the next free worker picks the task up.

use flotilla_core::RunError;
use serde::{Deserialize, Serialize};

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts a task gets, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Whether a task that has already failed `failed_attempts` times may be
    /// queued again.
    pub fn allows_retry(&self, failed_attempts: usize) -> bool {
        failed_attempts < self.max_attempts as usize
    }

    /// Decide what happens to a task after a failed attempt
    pub fn decide<E: Retryable>(&self, error: &E, failed_attempts: usize) -> RetryDecision {
        if error.is_retryable() && self.allows_retry(failed_attempts) {
            RetryDecision::Requeue
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    GiveUp,
}

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is retryable
    fn is_retryable(&self) -> bool;
}

impl Retryable for RunError {
    fn is_retryable(&self) -> bool {
        RunError::is_retryable(self)
    }
}
