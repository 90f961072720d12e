//! Tasks and their identity
//!
//! This module provides:
//! - [`Task`] - one unit of work with lifecycle state and a cancellation signal
//! - [`TaskMetadata`] - identity metadata supplied with every dispatch
//! - [`Stopwatch`] - lap timer used for queue and execution timings
//!
//! # Lifecycle
//!
//! ```text
//!  dispatch_job ──► PreQueued ──► InQueue ──► Executing ──► Exited
//!                                    │                        ▲
//!                                    └── canceled while ──────┘
//!                                        queued (handler skipped)
//! ```
//!
//! Exit status is `None` until the handler (or a canceller) reports one of
//! `Success`, `Error` or `Canceled`. The first report wins.

mod gate;
mod metadata;
mod stopwatch;
#[allow(clippy::module_inception)]
mod task;

pub(crate) use gate::Gate;

pub use metadata::{task_id, TaskMetadata, TASK_ID_LEN};
pub use stopwatch::{Lap, Stopwatch};
pub use task::{ExitStatus, QueueState, Task};

/// Result payload of a task
pub type TaskResult = serde_json::Map<String, serde_json::Value>;
