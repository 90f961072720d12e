//! Job registry
//!
//! Maps job names to handler closures and their [`JobOptions`]. The worker
//! pool looks jobs up here on dispatch; nothing else creates tasks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TaskExit;
use crate::task::Task;

/// Handler future output
pub type JobResult = Result<(), TaskExit>;

/// Job handler function type
pub type JobHandler =
    Arc<dyn Fn(Arc<Task>) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

/// Per-job scheduling options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Every dispatch creates a new task instead of joining a live one
    pub unique: bool,
    /// Keep the task indexed after it exits so repeat dispatches read its result
    pub persistent: bool,
    /// The job waits on sub-pools and must not run on replacement workers
    pub recursive: bool,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// A registered job
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub handler: JobHandler,
    pub options: JobOptions,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Registry of job handlers
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler, replacing any previous handler of that name
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register("move_file", |task| async move {
    ///     task.check_exit()?;
    ///     task.success();
    ///     Ok(())
    /// }, JobOptions::new());
    /// ```
    pub fn register<F, Fut>(&self, name: &str, handler: F, options: JobOptions)
    where
        F: Fn(Arc<Task>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |task| Box::pin(handler(task)));
        self.jobs.write().insert(
            name.to_string(),
            Job {
                name: name.to_string(),
                handler,
                options,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Job> {
        self.jobs.read().get(name).cloned()
    }

    /// Check if a job is registered
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Get all registered job names
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.job_names())
            .finish()
    }
}
