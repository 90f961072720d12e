//! Error types for the scheduling core
//!
//! Errors fall into three groups:
//! - [`SchedulingError`]: a dispatch or queue request was refused; no task runs
//! - [`JobError`]: the stored reason a task ended in `Error` or `Canceled`
//! - [`TaskExit`]: what a job handler returns to unwind early

use std::any::Any;
use std::sync::Arc;

/// A dispatch or queue request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    /// No handler registered under this name
    #[error("no job registered with name: {0}")]
    UnknownJob(String),

    /// Metadata reports a different job than the one being dispatched
    #[error("metadata job name {metadata} does not match dispatched job {job}")]
    JobNameMismatch { job: String, metadata: String },

    /// Metadata failed its own verification
    #[error("invalid task metadata: {0}")]
    InvalidMetadata(String),

    /// The target pool has already been signaled as fully queued
    #[error("task pool {0} is closed to new tasks")]
    PoolClosed(String),

    /// The worker pool is shutting down
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The worker pool has not been started
    #[error("worker pool is not running")]
    NotRunning,

    /// The task is bound to a different pool
    #[error("task {task_id} already belongs to pool {pool_id}")]
    AlreadyQueued { task_id: String, pool_id: String },

    /// The task carries an error from a previous run
    #[error("task {0} has a previous error and cannot be queued")]
    PreviousError(String),

    /// A newer task with the same identity is live
    #[error("task {0} was superseded by a newer dispatch")]
    Superseded(String),
}

/// Why a task ended without success
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The job body reported a failure
    #[error("job failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The reaper canceled the task after its deadline passed
    #[error("task timed out")]
    Timeout,

    /// The job body panicked and the worker recovered
    #[error("worker {worker_id} recovered panic: {message}")]
    Panicked { worker_id: u64, message: String },

    /// The task was canceled
    #[error("task canceled")]
    Canceled,
}

impl JobError {
    /// Wrap any error as a job failure
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Whether this error came from the reaper
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// Early exit from a job handler
///
/// Returned by [`Task::check_exit`](crate::task::Task::check_exit) and
/// [`Task::fail`](crate::task::Task::fail) so handlers can unwind with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskExit {
    /// The task was canceled
    #[error("task canceled")]
    Canceled,

    /// The task recorded a failure
    #[error("task failed")]
    Failed,
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker pool lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker pool already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Worker pool was shut down and cannot be restarted
    #[error("worker pool has been shut down")]
    Stopped,

    /// No tokio runtime to spawn workers on
    #[error("worker pool must be started inside a tokio runtime")]
    NoRuntime,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparsable value
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduling_error_display() {
        let err = SchedulingError::UnknownJob("scan_directory".to_string());
        assert_eq!(err.to_string(), "no job registered with name: scan_directory");

        let err = SchedulingError::AlreadyQueued {
            task_id: "abcd1234".to_string(),
            pool_id: "pool-1".to_string(),
        };
        assert!(err.to_string().contains("abcd1234"));
        assert!(err.to_string().contains("pool-1"));
    }

    #[test]
    fn test_job_error_from_anyhow() {
        let err: JobError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, JobError::Failed(_)));
        assert!(err.to_string().contains("disk full"));
        assert!(!err.is_timeout());
        assert!(JobError::Timeout.is_timeout());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_job_error_is_clone() {
        let err = JobError::failed(std::io::Error::other("broken pipe"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
