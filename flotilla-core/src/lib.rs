//! Core dispatch primitives for Flotilla
//!
//! This crate contains the building blocks shared by every other Flotilla
//! crate: the closeable task queue, single-assignment result slots, the
//! task snapshot types written to run summaries, and the error types that
//! travel through result slots.

pub mod error;
pub mod queue;
pub mod slot;
pub mod snapshot;

// Re-export commonly used types at the crate root
pub use error::{ClosedError, RunError, TaskError, WorkerDisabledError};
pub use queue::{CloseableQueue, TryNext};
pub use slot::{AlreadySet, ResultSlot};
pub use snapshot::{AttemptRecord, TaskSnapshot, TaskStatus};
