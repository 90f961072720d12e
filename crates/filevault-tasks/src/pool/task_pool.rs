//! Task pools
//!
//! A pool groups tasks so a caller can wait for all of them. Pools nest: a
//! task may create a child pool for its sub-tasks, and every pool counts the
//! tasks of its descendants up to the root pool.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{panic_message, SchedulingError};
use crate::events::{TaskEvent, TaskEventKind};
use crate::task::{Gate, Task, TaskResult};
use crate::worker::WorkerPool;

/// Id of the pool that tasks dispatched without a pool land in
pub const GLOBAL_POOL_ID: &str = "GLOBAL";

/// Callback run once when a pool completes
pub type PoolCleanup = Box<dyn FnOnce(&Arc<TaskPool>) + Send>;

/// Snapshot of pool progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStatus {
    pub complete: usize,
    pub failed: usize,
    pub total: usize,
    /// Percent complete, 0 when empty
    pub progress: f64,
    #[serde(with = "crate::config::duration_millis")]
    pub runtime: Duration,
}

/// A named, possibly nested collection of tasks
pub struct TaskPool {
    id: String,
    global: bool,
    worker_pool: Weak<WorkerPool>,
    parent: Option<Arc<TaskPool>>,
    created_by: Option<Weak<Task>>,
    created_by_job: Option<String>,
    created_at: Instant,

    tasks: RwLock<HashMap<String, Arc<Task>>>,
    errors: Mutex<Vec<Arc<Task>>>,
    error_capacity: usize,

    total: AtomicUsize,
    completed: AtomicUsize,
    all_queued: AtomicBool,
    reserved_worker: AtomicBool,
    cancelled: AtomicBool,
    waiters: AtomicUsize,

    /// Serializes completion bookkeeping
    exit_lock: Mutex<()>,
    gate: Gate,
    cleanups: Mutex<Vec<PoolCleanup>>,
}

/// Completion work for a pool whose gate was just opened
pub(crate) struct PoolCompletion {
    pool: Arc<TaskPool>,
    cleanups: Vec<PoolCleanup>,
}

impl PoolCompletion {
    /// Run cleanups, deregister the pool and announce completion.
    /// Call without holding any exit lock.
    pub(crate) fn run(self) {
        let PoolCompletion { pool, cleanups } = self;

        for cleanup in cleanups {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&pool))) {
                error!(
                    pool_id = %pool.id,
                    message = %panic_message(panic.as_ref()),
                    "Failed to execute task pool cleanup"
                );
            }
        }

        let status = pool.status();
        debug!(
            pool_id = %pool.id,
            total = status.total,
            failed = status.failed,
            "Task pool complete"
        );

        if let Some(wp) = pool.worker_pool() {
            wp.remove_task_pool(&pool.id);
            wp.publish(pool.event(TaskEventKind::PoolComplete, pool.status_payload()));
        }
    }
}

impl TaskPool {
    pub(crate) fn new_global(worker_pool: Weak<WorkerPool>, error_capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(
            GLOBAL_POOL_ID.to_string(),
            true,
            worker_pool,
            None,
            None,
            error_capacity,
        ))
    }

    pub(crate) fn new(
        worker_pool: Weak<WorkerPool>,
        parent: Option<Arc<TaskPool>>,
        created_by: Option<&Arc<Task>>,
        error_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            Uuid::now_v7().to_string(),
            false,
            worker_pool,
            parent,
            created_by,
            error_capacity,
        ))
    }

    fn build(
        id: String,
        global: bool,
        worker_pool: Weak<WorkerPool>,
        parent: Option<Arc<TaskPool>>,
        created_by: Option<&Arc<Task>>,
        error_capacity: usize,
    ) -> Self {
        Self {
            id,
            global,
            worker_pool,
            parent,
            created_by: created_by.map(Arc::downgrade),
            created_by_job: created_by.map(|task| task.job_name().to_string()),
            created_at: Instant::now(),
            tasks: RwLock::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            error_capacity,
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            all_queued: AtomicBool::new(false),
            reserved_worker: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            exit_lock: Mutex::new(()),
            gate: Gate::new(),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// A root pool has no parent, or only the global pool above it
    pub fn is_root(&self) -> bool {
        match &self.parent {
            None => true,
            Some(parent) => parent.global,
        }
    }

    pub fn parent(&self) -> Option<Arc<TaskPool>> {
        self.parent.clone()
    }

    /// The root of this pool's parent chain
    pub fn root_pool(self: &Arc<Self>) -> Arc<TaskPool> {
        let mut pool = self.clone();
        while !pool.is_root() {
            match pool.parent.clone() {
                Some(parent) => pool = parent,
                None => break,
            }
        }
        pool
    }

    /// This pool followed by each ancestor up to and including the root
    pub(crate) fn lineage(self: &Arc<Self>) -> Vec<Arc<TaskPool>> {
        let mut chain = vec![self.clone()];
        let mut pool = self.clone();
        while !pool.is_root() {
            match pool.parent.clone() {
                Some(parent) => {
                    chain.push(parent.clone());
                    pool = parent;
                }
                None => break,
            }
        }
        chain
    }

    pub fn created_by(&self) -> Option<Arc<Task>> {
        self.created_by.as_ref().and_then(Weak::upgrade)
    }

    /// Job name of the task that created this pool
    pub fn created_by_job(&self) -> Option<&str> {
        self.created_by_job.as_deref()
    }

    pub(crate) fn worker_pool(&self) -> Option<Arc<WorkerPool>> {
        self.worker_pool.upgrade()
    }

    pub fn is_all_queued(&self) -> bool {
        self.all_queued.load(Ordering::SeqCst)
    }

    /// Fully queued and every task finished
    pub fn is_complete(&self) -> bool {
        self.gate.is_open()
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let complete = self.completed();
        let total = self.total();
        let progress = if total == 0 {
            0.0
        } else {
            complete as f64 * 100.0 / total as f64
        };
        PoolStatus {
            complete,
            failed: self.errors.lock().len(),
            total,
            progress,
            runtime: self.created_at.elapsed(),
        }
    }

    // ---- membership ----

    /// Queue a task on this pool
    pub fn queue_task(self: &Arc<Self>, task: &Arc<Task>) -> Result<(), SchedulingError> {
        let wp = self.worker_pool().ok_or(SchedulingError::NotRunning)?;
        if wp.is_shutting_down() {
            return Err(SchedulingError::ShuttingDown);
        }
        if !wp.is_running() {
            return Err(SchedulingError::NotRunning);
        }

        {
            let mut tasks = self.tasks.write();
            if !self.global && self.is_all_queued() {
                warn!(
                    pool_id = %self.id,
                    task_id = %task.id(),
                    "Refusing to queue task on closed pool"
                );
                return Err(SchedulingError::PoolClosed(self.id.clone()));
            }

            let fresh = task.bind_to_pool(self)?;
            tasks.insert(task.id().to_string(), task.clone());
            if !fresh {
                debug!(pool_id = %self.id, task_id = %task.id(), "Task already queued on pool");
                return Ok(());
            }

            for pool in self.lineage() {
                pool.total.fetch_add(1, Ordering::SeqCst);
            }
        }

        debug!(pool_id = %self.id, task_id = %task.id(), job_name = %task.job_name(), "Queued task");
        wp.enqueue(task.clone());
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.read().values().cloned().collect()
    }

    pub(crate) fn remove_task(&self, task_id: &str) {
        self.tasks.write().remove(task_id);
    }

    /// Failed tasks, oldest first
    pub fn errors(&self) -> Vec<Arc<Task>> {
        self.errors.lock().clone()
    }

    pub fn add_error(&self, task: Arc<Task>) {
        let mut errors = self.errors.lock();
        if errors.len() >= self.error_capacity {
            warn!(
                pool_id = %self.id,
                task_id = %task.id(),
                "Failed task list is full, dropping task"
            );
            return;
        }
        errors.push(task);
    }

    // ---- completion ----

    /// Close the pool to new tasks
    ///
    /// If every queued task already finished, the pool completes now.
    pub fn signal_all_queued(self: &Arc<Self>) {
        if self.global {
            warn!("Ignoring all-queued signal on the global pool");
            return;
        }

        let completion = {
            let _exit = self.lock_exit();
            if self.all_queued.swap(true, Ordering::SeqCst) {
                debug!(pool_id = %self.id, "Pool already signaled all-queued");
                return;
            }
            if self.completed() == self.total() {
                self.take_completion()
            } else {
                None
            }
        };

        if let Some(completion) = completion {
            completion.run();
        }

        if self.reserved_worker.swap(false, Ordering::SeqCst) {
            if let Some(wp) = self.worker_pool() {
                wp.remove_worker();
            }
        }
    }

    /// Wait until the pool completes
    ///
    /// With `supplement_worker`, a replacement worker runs while the caller
    /// is parked so a worker blocked here does not shrink the pool. A
    /// `caller` task that is canceled stops the wait early.
    pub async fn wait(&self, supplement_worker: bool, caller: Option<&Task>) {
        if self.global || self.is_complete() {
            return;
        }
        if !self.is_all_queued() {
            warn!(pool_id = %self.id, "Waiting on pool that has not been signaled all-queued");
        }

        let wp = if supplement_worker {
            self.worker_pool()
        } else {
            None
        };
        if let Some(wp) = &wp {
            wp.supplement_begin();
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        match caller.map(Task::cancellation_token) {
            Some(token) => {
                tokio::select! {
                    _ = self.gate.wait() => {}
                    _ = token.cancelled() => {
                        debug!(pool_id = %self.id, "Pool wait interrupted by caller cancellation");
                    }
                }
            }
            None => self.gate.wait().await,
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        if let Some(wp) = &wp {
            wp.supplement_end();
        }
    }

    /// Callers currently parked in [`wait`](Self::wait)
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Run `cleanup` when the pool completes, or now if it already has
    pub fn add_cleanup(self: &Arc<Self>, cleanup: impl FnOnce(&Arc<TaskPool>) + Send + 'static) {
        let exit = self.lock_exit();
        if !self.gate.is_open() {
            self.cleanups.lock().push(Box::new(cleanup));
            return;
        }
        drop(exit);

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(self))) {
            error!(
                pool_id = %self.id,
                message = %panic_message(panic.as_ref()),
                "Failed to execute task pool cleanup"
            );
        }
    }

    pub(crate) fn lock_exit(&self) -> MutexGuard<'_, ()> {
        self.exit_lock.lock()
    }

    /// Count one finished task. Caller holds the exit lock.
    pub(crate) fn record_task_exit(self: &Arc<Self>) -> Option<PoolCompletion> {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.global || !self.is_all_queued() || completed != self.total() {
            return None;
        }
        self.take_completion()
    }

    /// Count one finished task on the task's direct pool and decide whether
    /// the worker that ran it keeps going. Caller holds the exit lock.
    pub(crate) fn handle_task_exit(
        self: &Arc<Self>,
        is_replacement: bool,
    ) -> (bool, Option<PoolCompletion>) {
        let completion = self.record_task_exit();
        let can_continue = match self.worker_pool() {
            Some(wp) => wp.worker_may_continue(is_replacement),
            None => false,
        };
        (can_continue, completion)
    }

    /// Open the gate and take the cleanups. Caller holds the exit lock.
    fn take_completion(self: &Arc<Self>) -> Option<PoolCompletion> {
        if !self.gate.open() {
            return None;
        }
        Some(PoolCompletion {
            pool: self.clone(),
            cleanups: std::mem::take(&mut *self.cleanups.lock()),
        })
    }

    // ---- cancellation ----

    /// Close the pool and signal every task. Returns the signaled tasks.
    pub(crate) fn cancel_tasks(self: &Arc<Self>) -> Vec<Arc<Task>> {
        let (tasks, completion) = {
            let tasks = self.tasks.write();
            let completion = if self.global {
                None
            } else {
                let _exit = self.lock_exit();
                let already = self.all_queued.swap(true, Ordering::SeqCst);
                if !already && self.completed() == self.total() {
                    self.take_completion()
                } else {
                    None
                }
            };
            for task in tasks.values() {
                task.cancel();
            }
            (tasks.values().cloned().collect::<Vec<_>>(), completion)
        };

        if let Some(completion) = completion {
            completion.run();
        }
        tasks
    }

    /// Cancel every task in the pool and wait for each to exit
    pub async fn cancel(self: &Arc<Self>) {
        let tasks = self.cancel_tasks();
        for task in &tasks {
            task.wait().await;
        }

        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool_id = %self.id, tasks = tasks.len(), "Task pool canceled");
        if let Some(wp) = self.worker_pool() {
            wp.publish(self.event(TaskEventKind::PoolCancelled, self.status_payload()));
        }
    }

    /// Hand a reserved queue worker back when the pool is signaled
    pub(crate) fn mark_reserved_worker(&self) {
        self.reserved_worker.store(true, Ordering::SeqCst);
    }

    // ---- events ----

    pub(crate) fn event(&self, kind: TaskEventKind, payload: TaskResult) -> TaskEvent {
        let event = TaskEvent::new(kind, self.id.clone(), payload);
        match &self.created_by_job {
            Some(job) => event.with_job_name(job.clone()),
            None => event,
        }
    }

    pub(crate) fn status_payload(&self) -> TaskResult {
        match serde_json::to_value(self.status()) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => TaskResult::new(),
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("id", &self.id)
            .field("global", &self.global)
            .field("total", &self.total())
            .field("completed", &self.completed())
            .field("all_queued", &self.is_all_queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(parent: Option<Arc<TaskPool>>) -> Arc<TaskPool> {
        TaskPool::new(Weak::new(), parent, None, 2)
    }

    #[test]
    fn test_root_resolution() {
        let global = TaskPool::new_global(Weak::new(), 10);
        let root = detached(Some(global.clone()));
        let child = detached(Some(root.clone()));
        let grandchild = detached(Some(child.clone()));

        assert!(global.is_root());
        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(grandchild.root_pool().id(), root.id());
        assert_eq!(grandchild.lineage().len(), 3);
        assert_eq!(root.lineage().len(), 1);
    }

    #[test]
    fn test_empty_pool_completes_on_signal() {
        let pool = detached(None);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.add_cleanup(move |_| flag.store(true, Ordering::SeqCst));

        pool.signal_all_queued();
        assert!(pool.is_complete());
        assert!(ran.load(Ordering::SeqCst));

        // second signal is a no-op
        pool.signal_all_queued();
        assert!(pool.is_complete());
    }

    #[test]
    fn test_completion_gate_opens_once() {
        let pool = detached(None);
        pool.total.store(2, Ordering::SeqCst);
        pool.signal_all_queued();
        assert!(!pool.is_complete());

        let first = {
            let _exit = pool.lock_exit();
            pool.record_task_exit()
        };
        assert!(first.is_none());

        let second = {
            let _exit = pool.lock_exit();
            pool.record_task_exit()
        };
        assert!(second.is_some());
        assert!(pool.is_complete());
        assert!(pool.take_completion().is_none());
    }

    #[test]
    fn test_add_cleanup_after_complete_runs_now() {
        let pool = detached(None);
        pool.signal_all_queued();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.add_cleanup(move |_| flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_cleanup_is_contained() {
        let pool = detached(None);
        pool.add_cleanup(|_| panic!("cleanup exploded"));
        pool.signal_all_queued();
        assert!(pool.is_complete());
    }

    #[test]
    fn test_new_pool_has_no_errors() {
        let pool = detached(None);
        assert_eq!(pool.error_capacity, 2);
        assert!(pool.errors().is_empty());
        assert_eq!(pool.status().failed, 0);
    }

    #[test]
    fn test_status_progress() {
        let pool = detached(None);
        assert_eq!(pool.status().progress, 0.0);
        pool.total.store(4, Ordering::SeqCst);
        pool.completed.store(1, Ordering::SeqCst);
        let status = pool.status();
        assert_eq!(status.total, 4);
        assert_eq!(status.complete, 1);
        assert_eq!(status.progress, 25.0);
    }

    #[test]
    fn test_global_never_completes() {
        let global = TaskPool::new_global(Weak::new(), 10);
        global.signal_all_queued();
        assert!(!global.is_all_queued());
        assert!(!global.is_complete());

        let _exit = global.lock_exit();
        assert!(global.record_task_exit().is_none());
    }

    #[tokio::test]
    async fn test_wait_on_complete_pool_returns() {
        let pool = detached(None);
        pool.signal_all_queued();
        tokio::time::timeout(Duration::from_secs(1), pool.wait(false, None))
            .await
            .expect("wait returned");

        let global = TaskPool::new_global(Weak::new(), 10);
        tokio::time::timeout(Duration::from_secs(1), global.wait(false, None))
            .await
            .expect("global wait returned");
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let pool = detached(None);
        pool.cancel().await;
        pool.cancel().await;
        assert!(pool.is_all_queued());
        assert!(pool.is_complete());
    }

    #[test]
    fn test_status_payload_has_counts() {
        let pool = detached(None);
        let payload = pool.status_payload();
        assert_eq!(payload.get("total"), Some(&serde_json::Value::from(0)));
        assert!(payload.contains_key("runtime"));
    }
}
