//! Task lifecycle events
//!
//! The worker pool announces task and pool transitions through an injected
//! [`Broadcaster`]. Delivery is up to the implementation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::task::TaskResult;

/// Kinds of lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    TaskComplete,
    SubTaskComplete,
    #[serde(rename = "task_failure")]
    TaskFailed,
    TaskCanceled,
    PoolCreated,
    PoolComplete,
    PoolCancelled,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskComplete => "task_complete",
            Self::SubTaskComplete => "sub_task_complete",
            Self::TaskFailed => "task_failure",
            Self::TaskCanceled => "task_canceled",
            Self::PoolCreated => "pool_created",
            Self::PoolComplete => "pool_complete",
            Self::PoolCancelled => "pool_cancelled",
        }
    }

    /// Whether the subject of this event is a pool rather than a task
    pub fn is_pool_event(&self) -> bool {
        matches!(
            self,
            Self::SubTaskComplete | Self::PoolCreated | Self::PoolComplete | Self::PoolCancelled
        )
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    /// Task id, or pool id for pool events
    pub subject_id: String,
    /// Job of the task, or of the task that created the pool
    pub job_name: Option<String>,
    pub payload: TaskResult,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind, subject_id: impl Into<String>, payload: TaskResult) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            job_name: None,
            payload,
            at: Utc::now(),
        }
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }
}

/// Receives lifecycle events from the worker pool
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn publish(&self, event: TaskEvent) {
        trace!(kind = %event.kind, subject_id = %event.subject_id, "Dropping event");
    }
}

/// Fans events out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<TaskEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
