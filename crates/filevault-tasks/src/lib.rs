//! FileVault task scheduling core
//!
//! A hierarchical work-queue for a self-hosted file and media server.
//! Directory scans, file moves, uploads, zip creation and backup replication
//! all run as [`Task`]s on a bounded [`WorkerPool`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          WorkerPool                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐  │
//! │  │ JobRegistry  │   │  Task index  │   │     Pool index      │  │
//! │  │ name → (fn,  │   │ id → Task    │   │ id → TaskPool       │  │
//! │  │   options)   │   │ (dedup)      │   │ (GLOBAL + nested)   │  │
//! │  └──────────────┘   └──────────────┘   └─────────────────────┘  │
//! │                                                                 │
//! │  Shared queue ◄── retry buffer      Reaper      Broadcaster     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one live task per job identity (job name + metadata)
//! - Bounded worker concurrency, even when tasks block on sub-pools
//! - Cooperative cancellation that may race a task's own outcome report;
//!   the first terminal status wins
//! - Completion counts propagate from a task's pool to its root pool
//!
//! # Example
//!
//! ```ignore
//! use filevault_tasks::prelude::*;
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::from_env()?, Arc::new(NoopBroadcaster));
//! pool.register_job("scan_directory", scan_directory, JobOptions::new().recursive());
//! pool.run()?;
//!
//! let task = pool.dispatch_job("scan_directory", ScanMeta::new("/media"), None)?;
//! task.wait().await;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pool;
pub mod task;
pub mod worker;

pub use config::WorkerPoolConfig;
pub use engine::{Job, JobHandler, JobOptions, JobRegistry, JobResult};
pub use error::{ConfigError, JobError, SchedulingError, TaskExit, WorkerPoolError};
pub use events::{Broadcaster, ChannelBroadcaster, NoopBroadcaster, TaskEvent, TaskEventKind};
pub use pool::{PoolStatus, TaskPool, GLOBAL_POOL_ID};
pub use task::{ExitStatus, QueueState, Task, TaskMetadata, TaskResult};
pub use worker::{RunState, WorkerPool, WorkerPoolStatus};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::WorkerPoolConfig;
    pub use crate::engine::JobOptions;
    pub use crate::error::{JobError, SchedulingError, TaskExit};
    pub use crate::events::{Broadcaster, ChannelBroadcaster, NoopBroadcaster, TaskEvent, TaskEventKind};
    pub use crate::pool::{PoolStatus, TaskPool};
    pub use crate::task::{ExitStatus, QueueState, Task, TaskMetadata, TaskResult};
    pub use crate::worker::{WorkerPool, WorkerPoolStatus};
    pub use std::sync::Arc;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Weak};

    use crate::engine::{JobOptions, JobRegistry};
    use crate::task::{Task, TaskMetadata};

    pub(crate) struct PathMeta(pub String);

    impl TaskMetadata for PathMeta {
        fn job_name(&self) -> &str {
            "scan_file"
        }

        fn meta_string(&self) -> String {
            self.0.clone()
        }
    }

    /// A task with no worker pool behind it
    pub(crate) fn detached_task(id: &str) -> Arc<Task> {
        let registry = JobRegistry::new();
        registry.register("scan_file", |_task| async { Ok(()) }, JobOptions::new());
        let job = registry.get("scan_file").expect("registered");
        Task::new(
            id.to_string(),
            job,
            Arc::new(PathMeta(format!("/media/{id}"))),
            Weak::new(),
        )
    }
}
