//! Resilience patterns for Flotilla
//!
//! This crate provides the scoped shutdown primitive used by every
//! long-lived Flotilla component, and the requeue-based retry policy of the
//! worker pool.

pub mod retry;
pub mod scope;

// Re-export commonly used types
pub use retry::{RetryDecision, RetryPolicy, Retryable};
pub use scope::{scoped, AggregateError, ClosedSignal, ExitAction, Scope, Scoped};
