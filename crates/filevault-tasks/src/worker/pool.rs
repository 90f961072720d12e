//! Worker pool for task execution
//!
//! Owns the shared queue, the retry buffer, the reaper and an elastic set of
//! workers. All task creation goes through [`WorkerPool::dispatch_job`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use super::queue::TaskQueue;
use super::reaper::{run_reaper, Hit};
use super::retry::{run_drainer, RetryBuffer};
use crate::config::{WorkerPoolConfig, MIN_INTERVAL};
use crate::engine::{JobOptions, JobRegistry, JobResult};
use crate::error::{panic_message, JobError, SchedulingError, TaskExit, WorkerPoolError};
use crate::events::{Broadcaster, TaskEvent, TaskEventKind};
use crate::pool::{PoolCompletion, TaskPool, GLOBAL_POOL_ID};
use crate::task::{task_id, ExitStatus, Task, TaskMetadata};

/// Worker pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, workers not started
    Idle,
    /// Workers running and accepting tasks
    Running,
    /// Shutting down (finishing current tasks, not accepting new ones)
    Draining,
    /// Workers have stopped
    Stopped,
}

/// Snapshot of worker pool load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStatus {
    /// Tasks waiting on the shared queue
    pub queued: usize,
    /// Tasks queued since start
    pub lifetime_queued: u64,
    /// Workers currently running a handler
    pub busy: usize,
    /// Live workers, replacements included
    pub alive: usize,
    /// Tasks waiting in the retry buffer
    pub buffered: usize,
}

/// Worker pool for executing jobs
///
/// Always lives behind an `Arc`; tasks and pools keep weak references back.
///
/// # Example
///
/// ```ignore
/// use filevault_tasks::prelude::*;
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(4), Arc::new(NoopBroadcaster));
///
/// pool.register_job("move_file", |task| async move {
///     let meta = task.meta::<MoveMeta>().expect("move metadata");
///     task.req_no_err(tokio::fs::rename(&meta.from, &meta.to).await)?;
///     task.success();
///     Ok(())
/// }, JobOptions::new());
///
/// pool.run()?;
///
/// let task = pool.dispatch_job("move_file", MoveMeta::new(from, to), None)?;
/// task.wait().await;
///
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    me: Weak<WorkerPool>,
    config: WorkerPoolConfig,
    registry: JobRegistry,
    broadcaster: Arc<dyn Broadcaster>,

    queue: Arc<TaskQueue>,
    retry: Arc<RetryBuffer>,
    tasks: DashMap<String, Arc<Task>>,
    pools: Mutex<HashMap<String, Arc<TaskPool>>>,
    global: Arc<TaskPool>,

    target_workers: AtomicI64,
    live_workers: AtomicI64,
    busy_workers: AtomicI64,
    lifetime_queued: AtomicU64,
    next_worker_id: AtomicU64,

    hits_tx: mpsc::UnboundedSender<Hit>,
    hits_rx: Mutex<Option<mpsc::UnboundedReceiver<Hit>>>,

    state: RwLock<RunState>,
    runtime: Mutex<Option<Handle>>,
    tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(config: WorkerPoolConfig, broadcaster: Arc<dyn Broadcaster>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hits_tx, hits_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|me: &Weak<WorkerPool>| {
            let global = TaskPool::new_global(me.clone(), config.failed_task_capacity);
            let mut pools = HashMap::new();
            pools.insert(GLOBAL_POOL_ID.to_string(), global.clone());

            Self {
                me: me.clone(),
                queue: Arc::new(TaskQueue::new(config.queue_capacity())),
                retry: Arc::new(RetryBuffer::new()),
                tasks: DashMap::new(),
                pools: Mutex::new(pools),
                global,
                target_workers: AtomicI64::new(0),
                live_workers: AtomicI64::new(0),
                busy_workers: AtomicI64::new(0),
                lifetime_queued: AtomicU64::new(0),
                next_worker_id: AtomicU64::new(1),
                hits_tx,
                hits_rx: Mutex::new(Some(hits_rx)),
                state: RwLock::new(RunState::Idle),
                runtime: Mutex::new(None),
                tracker: TaskTracker::new(),
                shutdown_tx,
                shutdown_rx,
                registry: JobRegistry::new(),
                broadcaster,
                config,
            }
        })
    }

    /// Register a job handler
    pub fn register_job<F, Fut>(&self, name: &str, handler: F, options: JobOptions)
    where
        F: Fn(Arc<Task>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.registry.register(name, handler, options);
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Start the reaper, the retry drainer, the status reporter and the
    /// base workers. Must be called inside a tokio runtime.
    #[instrument(skip(self), fields(workers = self.config.workers))]
    pub fn run(&self) -> Result<(), WorkerPoolError> {
        let handle = Handle::try_current().map_err(|_| WorkerPoolError::NoRuntime)?;
        {
            let mut state = self.state.write();
            match *state {
                RunState::Running => return Err(WorkerPoolError::AlreadyRunning),
                RunState::Draining | RunState::Stopped => return Err(WorkerPoolError::Stopped),
                RunState::Idle => *state = RunState::Running,
            }
        }
        *self.runtime.lock() = Some(handle);

        info!(
            workers = self.config.workers,
            queue_capacity = self.queue.capacity(),
            "Starting worker pool"
        );

        if let Some(hits) = self.hits_rx.lock().take() {
            self.spawn(run_reaper(hits, self.shutdown_rx.clone()));
        }
        self.spawn(run_drainer(
            self.retry.clone(),
            self.queue.clone(),
            self.config.drain_interval,
            self.shutdown_rx.clone(),
        ));
        self.spawn_status_reporter();

        for _ in 0..self.config.workers {
            self.target_workers.fetch_add(1, Ordering::SeqCst);
            self.spawn_worker(false);
        }

        Ok(())
    }

    /// Stop accepting work, let running handlers finish, and wait for the
    /// workers to exit
    ///
    /// Tasks still queued or buffered are canceled and finalized, so their
    /// waiters and pools are released.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut state = self.state.write();
            match *state {
                RunState::Stopped => return Ok(()),
                RunState::Idle => {
                    *state = RunState::Stopped;
                    return Ok(());
                }
                _ => *state = RunState::Draining,
            }
        }

        info!(busy = self.busy(), "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
        self.tracker.close();
        // running handlers may be waiting on queued children
        self.abandon_pending();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_ok();
        self.abandon_pending();

        if !drained {
            warn!(
                remaining_workers = self.live_workers.load(Ordering::SeqCst),
                "Shutdown timeout reached"
            );
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        *self.state.write() = RunState::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Cancel and finalize everything still on the queue or in the retry
    /// buffer, so waiters on those tasks are released
    fn abandon_pending(&self) {
        let mut pending = self.retry.take_all();
        while let Some(task) = self.queue.try_pop() {
            pending.push(task);
        }
        if pending.is_empty() {
            return;
        }
        info!(tasks = pending.len(), "Canceling tasks that never ran");
        for task in &pending {
            self.abandon(task);
        }
    }

    pub fn run_state(&self) -> RunState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn status(&self) -> WorkerPoolStatus {
        WorkerPoolStatus {
            queued: self.queue.len(),
            lifetime_queued: self.lifetime_queued.load(Ordering::SeqCst),
            busy: self.busy(),
            alive: self.live_workers.load(Ordering::SeqCst).max(0) as usize,
            buffered: self.retry.len(),
        }
    }

    fn busy(&self) -> usize {
        self.busy_workers.load(Ordering::SeqCst).max(0) as usize
    }

    // ---- dispatch ----

    /// Create or reuse the task for `(job_name, metadata)` and queue it on
    /// `pool`, or on the global pool when `pool` is `None`
    ///
    /// A live task with the same identity is returned as is.
    pub fn dispatch_job<M: TaskMetadata>(
        &self,
        job_name: &str,
        metadata: M,
        pool: Option<&Arc<TaskPool>>,
    ) -> Result<Arc<Task>, SchedulingError> {
        let job = self
            .registry
            .get(job_name)
            .ok_or_else(|| SchedulingError::UnknownJob(job_name.to_string()))?;
        if metadata.job_name() != job_name {
            return Err(SchedulingError::JobNameMismatch {
                job: job_name.to_string(),
                metadata: metadata.job_name().to_string(),
            });
        }
        metadata
            .verify()
            .map_err(|err| SchedulingError::InvalidMetadata(err.to_string()))?;
        self.ensure_accepting()?;

        let pool = pool.cloned().unwrap_or_else(|| self.global.clone());
        let id = task_id(job_name, &metadata.meta_string(), job.options.unique);
        let metadata = Arc::new(metadata);

        let task = match self.tasks.entry(id.clone()) {
            Entry::Occupied(existing) => {
                trace!(task_id = %id, job_name, "Task already exists, not queuing");
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let task = Task::new(id.clone(), job, metadata.clone(), self.me.clone());
                slot.insert(task.clone());
                task
            }
        };

        if let Err(err) = pool.queue_task(&task) {
            self.untrack_task(&task);
            return Err(err);
        }

        self.publish(
            TaskEvent::new(TaskEventKind::TaskCreated, id, metadata.format_to_result())
                .with_job_name(job_name),
        );
        Ok(task)
    }

    /// Create a task pool, nested under `created_by`'s pool when given
    ///
    /// With `reserve_worker`, a replacement worker runs until the pool is
    /// signaled all-queued.
    pub fn new_task_pool(
        &self,
        reserve_worker: bool,
        created_by: Option<&Arc<Task>>,
    ) -> Result<Arc<TaskPool>, SchedulingError> {
        let parent = created_by.and_then(|task| task.task_pool());
        let pool = self.create_pool(parent, created_by)?;
        if reserve_worker {
            pool.mark_reserved_worker();
            self.add_replacement_worker();
        }
        if let Some(task) = created_by {
            task.set_child_pool(pool.clone());
        }
        Ok(pool)
    }

    /// Create a task pool whose tasks count toward `parent`
    pub fn new_child_pool(
        &self,
        parent: &Arc<TaskPool>,
    ) -> Result<Arc<TaskPool>, SchedulingError> {
        self.create_pool(Some(parent.clone()), None)
    }

    fn create_pool(
        &self,
        parent: Option<Arc<TaskPool>>,
        created_by: Option<&Arc<Task>>,
    ) -> Result<Arc<TaskPool>, SchedulingError> {
        self.ensure_accepting()?;

        let pool = TaskPool::new(
            self.me.clone(),
            parent,
            created_by,
            self.config.failed_task_capacity,
        );
        self.pools
            .lock()
            .insert(pool.id().to_string(), pool.clone());

        debug!(
            pool_id = %pool.id(),
            root = pool.is_root(),
            created_by = ?pool.created_by_job(),
            "Created task pool"
        );
        self.publish(pool.event(TaskEventKind::PoolCreated, pool.status_payload()));
        Ok(pool)
    }

    fn ensure_accepting(&self) -> Result<(), SchedulingError> {
        if self.is_shutting_down() {
            return Err(SchedulingError::ShuttingDown);
        }
        if !self.is_running() {
            return Err(SchedulingError::NotRunning);
        }
        Ok(())
    }

    // ---- lookup ----

    pub fn get_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn get_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get_tasks_by_job_name(&self, job_name: &str) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().job_name() == job_name)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_task_pool(&self, pool_id: &str) -> Option<Arc<TaskPool>> {
        self.pools.lock().get(pool_id).cloned()
    }

    /// Pools created by a task of the given job
    pub fn get_task_pool_by_job_name(&self, job_name: &str) -> Vec<Arc<TaskPool>> {
        self.pools
            .lock()
            .values()
            .filter(|pool| pool.created_by_job() == Some(job_name))
            .cloned()
            .collect()
    }

    pub fn global_pool(&self) -> Arc<TaskPool> {
        self.global.clone()
    }

    // ---- crate plumbing ----

    pub(crate) fn publish(&self, event: TaskEvent) {
        self.broadcaster.publish(event);
    }

    /// Put a task back in the index for a recompute. Returns whether it
    /// was already there; fails if a newer dispatch took its id.
    pub(crate) fn claim_task(&self, task: &Arc<Task>) -> Result<bool, SchedulingError> {
        match self.tasks.entry(task.id().to_string()) {
            Entry::Occupied(existing) if Arc::ptr_eq(existing.get(), task) => Ok(true),
            Entry::Occupied(_) => Err(SchedulingError::Superseded(task.id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(false)
            }
        }
    }

    pub(crate) fn untrack_task(&self, task: &Arc<Task>) {
        self.tasks.remove_if(task.id(), |_, t| Arc::ptr_eq(t, task));
    }

    pub(crate) fn remove_task_pool(&self, pool_id: &str) {
        self.pools.lock().remove(pool_id);
    }

    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        self.lifetime_queued.fetch_add(1, Ordering::SeqCst);
        self.retry.offer(&self.queue, task);
    }

    pub(crate) fn add_reaper_hit(&self, deadline: Instant, task: &Arc<Task>) {
        if self.hits_tx.send(Hit::new(deadline, task)).is_err() {
            warn!(task_id = %task.id(), "Reaper stopped, deadline not enforced");
        }
    }

    /// A worker parks in a pool wait: hand its slot to a replacement
    pub(crate) fn supplement_begin(&self) {
        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
        self.add_replacement_worker();
    }

    pub(crate) fn supplement_end(&self) {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);
        self.remove_worker();
    }

    pub(crate) fn add_replacement_worker(&self) {
        self.target_workers.fetch_add(1, Ordering::SeqCst);
        self.spawn_worker(true);
    }

    /// Lower the target; a replacement worker retires at its next chance
    pub(crate) fn remove_worker(&self) {
        self.target_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Decide whether a worker that just finished a task keeps going.
    /// A worker told to stop is already uncounted.
    pub(crate) fn worker_may_continue(&self, is_replacement: bool) -> bool {
        if is_replacement && self.try_retire() {
            return false;
        }
        if self.is_shutting_down() {
            self.live_workers.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Uncount one worker if more are alive than the target
    fn try_retire(&self) -> bool {
        let mut live = self.live_workers.load(Ordering::SeqCst);
        loop {
            if live <= self.target_workers.load(Ordering::SeqCst) {
                return false;
            }
            match self.live_workers.compare_exchange(
                live,
                live - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.runtime.lock().as_ref() {
            Some(handle) => {
                self.tracker.spawn_on(future, handle);
            }
            None => error!("Worker pool is not running, dropping background task"),
        }
    }

    // ---- workers ----

    fn spawn_worker(&self, replacement: bool) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if self.runtime.lock().is_none() {
            warn!(replacement, "Worker pool is not running, not spawning worker");
            return;
        }
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        self.live_workers.fetch_add(1, Ordering::SeqCst);

        self.spawn(async move {
            if !me.work(worker_id, replacement).await {
                me.live_workers.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(worker_id, replacement, "Worker exited");
        });
    }

    /// Worker loop. Returns true if the worker was already uncounted.
    async fn work(&self, worker_id: u64, replacement: bool) -> bool {
        debug!(worker_id, replacement, "Launching worker");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            let next = if replacement {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => return false,
                    popped = tokio::time::timeout(
                        self.config.replacement_idle_timeout,
                        self.queue.pop(),
                    ) => popped.ok(),
                }
            } else {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => return false,
                    task = self.queue.pop() => Some(task),
                }
            };

            let Some(task) = next else {
                // idle replacement
                if self.try_retire() {
                    debug!(worker_id, "Idle replacement worker retiring");
                    return true;
                }
                continue;
            };

            if self.is_shutting_down() {
                self.abandon(&task);
                return false;
            }

            let task = if replacement && task.options().recursive {
                match self.defer_recursive(task) {
                    Some(task) => task,
                    None => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        continue;
                    }
                }
            } else {
                task
            };

            if !self.execute(&task, worker_id, replacement).await {
                return true;
            }
        }
    }

    /// Replacement workers must not run recursive jobs. Either put the task
    /// back, or park the run of recursive tasks at the queue head in the
    /// retry buffer and return the first other task.
    fn defer_recursive(&self, task: Arc<Task>) -> Option<Arc<Task>> {
        let live = self.live_workers.load(Ordering::SeqCst).max(0) as usize;
        if self.queue.free_slots() > live * 2 {
            trace!(task_id = %task.id(), "Replacement worker pushing recursive task back");
            if let Err(task) = self.queue.try_push(task) {
                self.retry.push(task);
            }
            return None;
        }

        let mut deferred = vec![task];
        while let Some(next) = self.queue.try_pop() {
            if next.options().recursive {
                deferred.push(next);
            } else {
                debug!(deferred = deferred.len(), "Replacement worker deferring recursive tasks");
                self.retry.extend(deferred);
                return Some(next);
            }
        }
        self.retry.extend(deferred);
        None
    }

    /// Run one task to completion and finalize it. Returns whether the
    /// worker keeps going.
    async fn execute(&self, task: &Arc<Task>, worker_id: u64, replacement: bool) -> bool {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);

        if task.begin_execution(worker_id) {
            trace!(worker_id, task_id = %task.id(), job_name = %task.job_name(), "Starting task");
            let handler = task.job().handler.clone();
            let run = {
                let task = task.clone();
                async move { handler(task).await }
            };

            match std::panic::AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) | Ok(Err(TaskExit::Failed)) => {}
                Ok(Err(TaskExit::Canceled)) => {
                    trace!(task_id = %task.id(), "Handler exited on cancellation");
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        worker_id,
                        task_id = %task.id(),
                        job_name = %task.job_name(),
                        %message,
                        "Worker recovered panic in task handler"
                    );
                    task.record_error(JobError::Panicked { worker_id, message });
                }
            }
        } else {
            trace!(task_id = %task.id(), "Task already has an exit status, skipping handler");
        }

        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
        self.finalize(task, Some(replacement))
    }

    /// Cancel a task that will never reach a worker and finalize it
    fn abandon(&self, task: &Arc<Task>) {
        debug!(task_id = %task.id(), job_name = %task.job_name(), "Abandoning task at shutdown");
        task.cancel();
        self.finalize(task, None);
    }

    /// Finalize a task and update its pools. `worker` is set when called
    /// from a worker loop, which then learns whether to keep going.
    fn finalize(&self, task: &Arc<Task>, worker: Option<bool>) -> bool {
        let finalizers = task.take_finalizers();
        let (_, status) = task.status();
        let direct = task.task_pool();

        self.publish_completion(task, status, direct.as_ref());
        task.run_finalizers(finalizers);

        if let Some(direct) = &direct {
            if status == ExitStatus::Error && !direct.is_global() {
                direct.add_error(task.clone());
                let root = direct.root_pool();
                if !Arc::ptr_eq(&root, direct) && !root.is_global() {
                    root.add_error(task.clone());
                }
            }
            if !task.options().persistent {
                direct.remove_task(task.id());
            }
        }
        if !task.options().persistent {
            self.untrack_task(task);
        }

        task.mark_exited();

        let Some(direct) = direct else {
            error!(task_id = %task.id(), "Executed task has no pool");
            return worker.is_some_and(|replacement| self.worker_may_continue(replacement));
        };

        // Root first, then down to the direct pool.
        let lineage = direct.lineage();
        let (can_continue, completions) = {
            let _exit: Vec<_> = lineage.iter().rev().map(|pool| pool.lock_exit()).collect();
            let mut completions: Vec<PoolCompletion> = lineage
                .iter()
                .skip(1)
                .filter_map(|pool| pool.record_task_exit())
                .collect();
            let (can_continue, completion) = match worker {
                Some(replacement) => direct.handle_task_exit(replacement),
                None => (false, direct.record_task_exit()),
            };
            completions.extend(completion);
            (can_continue, completions)
        };

        for completion in completions {
            completion.run();
        }
        can_continue
    }

    fn publish_completion(&self, task: &Task, status: ExitStatus, direct: Option<&Arc<TaskPool>>) {
        let kind = match status {
            ExitStatus::Error => TaskEventKind::TaskFailed,
            ExitStatus::Canceled => TaskEventKind::TaskCanceled,
            ExitStatus::Success | ExitStatus::None => TaskEventKind::TaskComplete,
        };

        let mut payload = task.event_payload();
        payload.insert(
            "queue_remaining".to_string(),
            Value::from((self.queue.len() + self.retry.len()) as u64),
        );
        payload.insert(
            "queue_total".to_string(),
            Value::from(self.lifetime_queued.load(Ordering::SeqCst)),
        );

        debug!(
            task_id = %task.id(),
            job_name = %task.job_name(),
            status = status.as_str(),
            "Task finished"
        );
        self.publish(
            TaskEvent::new(kind, task.id(), payload.clone()).with_job_name(task.job_name()),
        );

        if let Some(direct) = direct {
            if !direct.is_root() {
                let root = direct.root_pool();
                self.publish(
                    root.event(TaskEventKind::SubTaskComplete, payload)
                        .with_job_name(task.job_name()),
                );
            }
        }
    }

    fn spawn_status_reporter(&self) {
        let me = self.me.clone();
        let interval = self.config.status_interval.max(MIN_INTERVAL);
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(wp) = me.upgrade() else { break };
                        let status = wp.status();
                        if status.busy > 0 || last != Some(status) {
                            info!(
                                queued = status.queued,
                                buffered = status.buffered,
                                busy = status.busy,
                                alive = status.alive,
                                lifetime_queued = status.lifetime_queued,
                                "Worker pool status"
                            );
                        }
                        last = Some(status);
                    }
                    _ = shutdown_rx.wait_for(|stop| *stop) => {
                        debug!("Status reporter: shutdown requested");
                        break;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.run_state())
            .field("status", &self.status())
            .field("jobs", &self.registry.job_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopBroadcaster;

    struct Named(&'static str, &'static str);

    impl TaskMetadata for Named {
        fn job_name(&self) -> &str {
            self.0
        }

        fn meta_string(&self) -> String {
            self.1.to_string()
        }
    }

    struct Rejected;

    impl TaskMetadata for Rejected {
        fn job_name(&self) -> &str {
            "zip"
        }

        fn meta_string(&self) -> String {
            "bad".to_string()
        }

        fn verify(&self) -> anyhow::Result<()> {
            anyhow::bail!("zip needs at least one file")
        }
    }

    fn pool(workers: usize) -> Arc<WorkerPool> {
        let wp = WorkerPool::new(WorkerPoolConfig::new(workers), Arc::new(NoopBroadcaster));
        wp.register_job("zip", |_task| async { Ok(()) }, JobOptions::new());
        wp
    }

    #[test]
    fn test_dispatch_before_run() {
        let wp = pool(1);
        let err = wp.dispatch_job("zip", Named("zip", "a"), None).unwrap_err();
        assert_eq!(err, SchedulingError::NotRunning);
        assert!(wp.get_tasks().is_empty());
    }

    #[test]
    fn test_run_requires_runtime() {
        let wp = pool(1);
        assert!(matches!(wp.run(), Err(WorkerPoolError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_dispatch_validation() {
        let wp = pool(1);
        wp.run().unwrap();

        let err = wp.dispatch_job("backup", Named("backup", "a"), None).unwrap_err();
        assert_eq!(err, SchedulingError::UnknownJob("backup".to_string()));

        let err = wp.dispatch_job("zip", Named("backup", "a"), None).unwrap_err();
        assert!(matches!(err, SchedulingError::JobNameMismatch { .. }));

        let err = wp.dispatch_job("zip", Rejected, None).unwrap_err();
        assert!(matches!(err, SchedulingError::InvalidMetadata(_)));

        assert!(wp.get_tasks().is_empty());
        wp.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_twice() {
        let wp = pool(1);
        wp.run().unwrap();
        assert!(matches!(wp.run(), Err(WorkerPoolError::AlreadyRunning)));
        wp.shutdown().await.unwrap();
        assert_eq!(wp.run_state(), RunState::Stopped);
        assert!(matches!(wp.run(), Err(WorkerPoolError::Stopped)));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let wp = pool(1);
        wp.run().unwrap();

        let tp = wp.new_task_pool(false, None).unwrap();
        assert!(wp.get_task_pool(tp.id()).is_some());
        tp.signal_all_queued();
        assert!(wp.get_task_pool(tp.id()).is_none());

        let err = wp.dispatch_job("zip", Named("zip", "late"), Some(&tp)).unwrap_err();
        assert_eq!(err, SchedulingError::PoolClosed(tp.id().to_string()));
        assert!(wp.get_task(&task_id("zip", "late", false)).is_none());
        wp.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown() {
        let wp = pool(1);
        wp.run().unwrap();
        wp.shutdown().await.unwrap();

        let err = wp.dispatch_job("zip", Named("zip", "a"), None).unwrap_err();
        assert_eq!(err, SchedulingError::ShuttingDown);
        assert!(wp.new_task_pool(false, None).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_base_workers_counted() {
        let wp = pool(3);
        wp.run().unwrap();
        let status = wp.status();
        assert_eq!(status.alive, 3);
        assert_eq!(status.busy, 0);
        wp.shutdown().await.unwrap();
        assert_eq!(wp.status().alive, 0);
    }

    #[test]
    fn test_try_retire_only_above_target() {
        let wp = pool(1);
        wp.target_workers.store(2, Ordering::SeqCst);
        wp.live_workers.store(2, Ordering::SeqCst);
        assert!(!wp.try_retire());

        wp.remove_worker();
        assert!(wp.try_retire());
        assert!(!wp.try_retire());
        assert_eq!(wp.live_workers.load(Ordering::SeqCst), 1);
    }

    fn scan_pool(queue_capacity: usize, live: i64) -> Arc<WorkerPool> {
        let wp = WorkerPool::new(
            WorkerPoolConfig::new(1).with_queue_capacity_per_worker(queue_capacity),
            Arc::new(NoopBroadcaster),
        );
        wp.register_job("zip", |_task| async { Ok(()) }, JobOptions::new());
        wp.register_job(
            "scan_directory",
            |_task| async { Ok(()) },
            JobOptions::new().recursive(),
        );
        wp.live_workers.store(live, Ordering::SeqCst);
        wp
    }

    fn task_for(wp: &Arc<WorkerPool>, job: &'static str, key: &'static str) -> Arc<Task> {
        let definition = wp.registry().get(job).expect("registered job");
        Task::new(
            task_id(job, key, false),
            definition,
            Arc::new(Named(job, key)),
            Arc::downgrade(wp),
        )
    }

    #[test]
    fn test_defer_recursive_pushes_back_when_queue_has_room() {
        let wp = scan_pool(10, 2);
        let dir = task_for(&wp, "scan_directory", "/media");

        assert!(wp.defer_recursive(dir.clone()).is_none());
        assert_eq!(wp.queue.len(), 1);
        assert_eq!(wp.retry.len(), 0);
        assert!(Arc::ptr_eq(&wp.queue.try_pop().unwrap(), &dir));
    }

    #[test]
    fn test_defer_recursive_parks_run_when_queue_is_tight() {
        let wp = scan_pool(4, 2);
        let first = task_for(&wp, "scan_directory", "/media/a");
        for task in [
            task_for(&wp, "scan_directory", "/media/b"),
            task_for(&wp, "scan_directory", "/media/c"),
            task_for(&wp, "zip", "/media/c.zip"),
            task_for(&wp, "scan_directory", "/media/d"),
        ] {
            wp.queue.try_push(task).unwrap();
        }

        let next = wp.defer_recursive(first).expect("non-recursive task");
        assert_eq!(next.job_name(), "zip");
        assert_eq!(wp.retry.len(), 3);

        // the recursive task behind the zip stays queued
        assert_eq!(wp.queue.len(), 1);
        assert_eq!(wp.queue.try_pop().unwrap().metadata().meta_string(), "/media/d");

        let parked: Vec<_> = wp
            .retry
            .take_all()
            .iter()
            .map(|task| task.metadata().meta_string())
            .collect();
        assert_eq!(parked, ["/media/a", "/media/b", "/media/c"]);
    }

    #[test]
    fn test_defer_recursive_parks_everything_without_other_work() {
        let wp = scan_pool(2, 1);
        let first = task_for(&wp, "scan_directory", "/media/a");
        wp.queue.try_push(task_for(&wp, "scan_directory", "/media/b")).unwrap();
        wp.queue.try_push(task_for(&wp, "scan_directory", "/media/c")).unwrap();

        assert!(wp.defer_recursive(first).is_none());
        assert_eq!(wp.queue.len(), 0);
        assert_eq!(wp.retry.len(), 3);
    }

    #[test]
    fn test_claim_task_refuses_newer_instance() {
        let wp = scan_pool(4, 0);
        let old = task_for(&wp, "zip", "/media/a.zip");
        let newer = task_for(&wp, "zip", "/media/a.zip");

        assert_eq!(wp.claim_task(&old), Ok(false));
        assert_eq!(wp.claim_task(&old), Ok(true));

        wp.untrack_task(&old);
        wp.tasks.insert(newer.id().to_string(), newer.clone());
        assert_eq!(
            wp.claim_task(&old),
            Err(SchedulingError::Superseded(old.id().to_string()))
        );
        assert!(Arc::ptr_eq(&wp.get_task(old.id()).unwrap(), &newer));
    }
}

