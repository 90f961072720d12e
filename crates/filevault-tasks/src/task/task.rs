//! Task: one unit of asynchronous work

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::gate::Gate;
use super::metadata::TaskMetadata;
use super::stopwatch::{Lap, Stopwatch};
use super::TaskResult;
use crate::engine::{Job, JobOptions};
use crate::error::{panic_message, JobError, SchedulingError, TaskExit};
use crate::pool::TaskPool;
use crate::worker::WorkerPool;

/// Position of a task in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    PreQueued,
    InQueue,
    Executing,
    Exited,
}

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Not reported yet
    None,
    Success,
    Error,
    Canceled,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::None)
    }
}

type PostAction = Box<dyn FnOnce(TaskResult) + Send>;
type Cleanup = Box<dyn FnOnce(&Task) + Send>;
type ResultCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// One unit of asynchronous work
///
/// Tasks are created by [`WorkerPool::dispatch_job`] and handed to the job
/// handler as `Arc<Task>`. A handler reports its outcome with
/// [`success`](Self::success) or [`fail`](Self::fail) and polls for
/// cancellation with [`check_exit`](Self::check_exit) or
/// [`cancelled`](Self::cancelled).
///
/// # Example
///
/// ```ignore
/// pool.register_job("scan_directory", |task| async move {
///     let meta = task.meta::<ScanMeta>().expect("scan metadata");
///     for entry in list(&meta.path).await {
///         task.check_exit()?;
///         let size = task.req_no_err(stat(&entry).await)?;
///         task.set_result("bytes", size);
///     }
///     task.success();
///     Ok(())
/// }, JobOptions::new().recursive());
/// ```
pub struct Task {
    id: String,
    job: Job,
    metadata: Arc<dyn TaskMetadata>,
    metadata_any: Arc<dyn Any + Send + Sync>,
    worker_pool: Weak<WorkerPool>,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
}

struct TaskState {
    queue_state: QueueState,
    exit_status: ExitStatus,
    error: Option<JobError>,
    result: TaskResult,

    pool: Option<Arc<TaskPool>>,
    child_pool: Option<Arc<TaskPool>>,

    cancel: CancellationToken,
    gate: Arc<Gate>,
    timeout: Option<Instant>,

    /// Set once the worker has taken the hooks; later hooks run inline
    finalized: bool,
    post_action: Option<PostAction>,
    cleanups: Vec<Cleanup>,
    error_cleanups: Vec<Cleanup>,
    result_callback: Option<ResultCallback>,

    worker_id: Option<u64>,
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    stopwatch: Stopwatch,
}

impl TaskState {
    fn new() -> Self {
        Self {
            queue_state: QueueState::PreQueued,
            exit_status: ExitStatus::None,
            error: None,
            result: TaskResult::new(),
            pool: None,
            child_pool: None,
            cancel: CancellationToken::new(),
            gate: Arc::new(Gate::new()),
            timeout: None,
            finalized: false,
            post_action: None,
            cleanups: Vec::new(),
            error_cleanups: Vec::new(),
            result_callback: None,
            worker_id: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
            stopwatch: Stopwatch::start(),
        }
    }
}

/// Hooks taken from a task by the worker that finalizes it
pub(crate) struct Finalizers {
    status: ExitStatus,
    result: TaskResult,
    post_action: Option<PostAction>,
    cleanups: Vec<Cleanup>,
    error_cleanups: Vec<Cleanup>,
}

impl Task {
    pub(crate) fn new<M: TaskMetadata>(
        id: String,
        job: Job,
        metadata: Arc<M>,
        worker_pool: Weak<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            job,
            metadata: metadata.clone(),
            metadata_any: metadata,
            worker_pool,
            created_at: Utc::now(),
            state: Mutex::new(TaskState::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    pub fn options(&self) -> JobOptions {
        self.job.options
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub fn metadata(&self) -> &dyn TaskMetadata {
        self.metadata.as_ref()
    }

    /// Typed access to the metadata this task was dispatched with
    pub fn meta<M: TaskMetadata>(&self) -> Option<&M> {
        self.metadata_any.downcast_ref::<M>()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn worker_pool(&self) -> Option<Arc<WorkerPool>> {
        self.worker_pool.upgrade()
    }

    // ---- state ----

    /// Whether the task has exited, and its exit status
    pub fn status(&self) -> (bool, ExitStatus) {
        let st = self.state.lock();
        (st.queue_state == QueueState::Exited, st.exit_status)
    }

    pub fn queue_state(&self) -> QueueState {
        self.state.lock().queue_state
    }

    pub fn is_exited(&self) -> bool {
        self.queue_state() == QueueState::Exited
    }

    pub fn read_error(&self) -> Option<JobError> {
        self.state.lock().error.clone()
    }

    pub fn task_pool(&self) -> Option<Arc<TaskPool>> {
        self.state.lock().pool.clone()
    }

    pub fn child_pool(&self) -> Option<Arc<TaskPool>> {
        self.state.lock().child_pool.clone()
    }

    /// Attach the pool this task waits on, so canceling the task cancels it
    pub fn set_child_pool(&self, pool: Arc<TaskPool>) {
        self.state.lock().child_pool = Some(pool);
    }

    /// Worker that ran (or is running) the handler
    pub fn worker_id(&self) -> Option<u64> {
        self.state.lock().worker_id
    }

    // ---- cancellation ----

    /// Request cancellation
    ///
    /// Sets the cancellation signal and marks the task `Canceled` unless it
    /// already reported an outcome. The handler keeps running until it
    /// observes the signal; use [`wait`](Self::wait) to know when it stopped.
    pub fn cancel(&self) {
        self.cancel_inner(JobError::Canceled);
    }

    pub(crate) fn cancel_with(&self, err: JobError) {
        self.cancel_inner(err);
    }

    fn cancel_inner(&self, err: JobError) {
        let child = {
            let mut st = self.state.lock();
            if st.exit_status.is_terminal() || st.cancel.is_cancelled() {
                trace!(task_id = %self.id, "Cancel is a no-op, task already terminal");
                return;
            }
            st.cancel.cancel();
            st.exit_status = ExitStatus::Canceled;
            st.error = Some(err);
            st.child_pool.clone()
        };

        debug!(task_id = %self.id, job_name = %self.job.name, "Canceled task");

        if let Some(child) = child {
            child.cancel_tasks();
        }
    }

    /// Whether cancellation has been requested
    pub fn is_signaled(&self) -> bool {
        self.state.lock().cancel.is_cancelled()
    }

    /// Token that fires when this task is canceled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.lock().cancel.clone()
    }

    /// Resolves when the task is canceled
    pub async fn cancelled(&self) {
        let token = self.cancellation_token();
        token.cancelled().await;
    }

    /// Cooperative cancellation point
    pub fn check_exit(&self) -> Result<(), TaskExit> {
        if self.is_signaled() {
            Err(TaskExit::Canceled)
        } else {
            Ok(())
        }
    }

    // ---- outcome ----

    pub fn success(&self) {
        let mut st = self.state.lock();
        if st.exit_status.is_terminal() {
            return;
        }
        st.exit_status = ExitStatus::Success;
        drop(st);
        debug!(task_id = %self.id, job_name = %self.job.name, "Task reported success");
    }

    /// Like [`Task::success`], with a message that lands in the results
    /// under `message`
    pub fn success_with(&self, message: impl fmt::Display) {
        let message = message.to_string();
        let mut st = self.state.lock();
        if st.exit_status.is_terminal() {
            return;
        }
        st.exit_status = ExitStatus::Success;
        st.result.insert("message".to_string(), Value::String(message.clone()));
        drop(st);
        debug!(task_id = %self.id, job_name = %self.job.name, %message, "Task reported success");
    }

    /// Record a failure and return the exit for the handler to propagate
    ///
    /// Ignored if the task already reported an outcome or was canceled.
    pub fn fail(&self, err: impl Into<anyhow::Error>) -> TaskExit {
        self.record_error(JobError::failed(err))
    }

    /// Turn an `Err` into [`fail`](Self::fail)
    pub fn req_no_err<T, E>(&self, result: Result<T, E>) -> Result<T, TaskExit>
    where
        E: Into<anyhow::Error>,
    {
        result.map_err(|err| self.fail(err))
    }

    pub(crate) fn record_error(&self, err: JobError) -> TaskExit {
        let mut st = self.state.lock();
        match st.exit_status {
            ExitStatus::None => {}
            ExitStatus::Canceled => return TaskExit::Canceled,
            _ => return TaskExit::Failed,
        }
        warn!(task_id = %self.id, job_name = %self.job.name, error = %err, "Task failed");
        st.exit_status = ExitStatus::Error;
        st.error = Some(err);
        TaskExit::Failed
    }

    // ---- results ----

    pub fn set_result(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut results = TaskResult::new();
        results.insert(key.into(), value.into());
        self.set_results(results);
    }

    /// Merge into the result and notify the result callback
    pub fn set_results(&self, results: TaskResult) {
        let notify = {
            let mut st = self.state.lock();
            st.result.extend(results);
            st.result_callback
                .clone()
                .map(|callback| (callback, st.result.clone()))
        };
        if let Some((callback, snapshot)) = notify {
            callback(&snapshot);
        }
    }

    /// Called with the full result after every update
    pub fn on_result(&self, callback: impl Fn(&TaskResult) + Send + Sync + 'static) {
        self.state.lock().result_callback = Some(Arc::new(callback));
    }

    pub fn get_result(&self, key: &str) -> Option<Value> {
        self.state.lock().result.get(key).cloned()
    }

    pub fn get_results(&self) -> TaskResult {
        self.state.lock().result.clone()
    }

    // ---- hooks ----

    /// Run `action` with the result once the task succeeds
    pub fn set_post_action(&self, action: impl FnOnce(TaskResult) + Send + 'static) {
        let mut st = self.state.lock();
        if !st.finalized {
            st.post_action = Some(Box::new(action));
            return;
        }
        let succeeded = st.exit_status == ExitStatus::Success;
        let result = st.result.clone();
        drop(st);
        if succeeded {
            run_hook(&self.id, "post_action", || action(result));
        }
    }

    /// Run `cleanup` when the task is finalized, whatever the outcome
    pub fn set_cleanup(&self, cleanup: impl FnOnce(&Task) + Send + 'static) {
        let mut st = self.state.lock();
        if !st.finalized {
            st.cleanups.push(Box::new(cleanup));
            return;
        }
        drop(st);
        run_hook(&self.id, "cleanup", || cleanup(self));
    }

    /// Run `cleanup` when the task is finalized after an error or cancel
    pub fn set_error_cleanup(&self, cleanup: impl FnOnce(&Task) + Send + 'static) {
        let mut st = self.state.lock();
        if !st.finalized {
            st.error_cleanups.push(Box::new(cleanup));
            return;
        }
        let failed = matches!(st.exit_status, ExitStatus::Error | ExitStatus::Canceled);
        drop(st);
        if failed {
            run_hook(&self.id, "error_cleanup", || cleanup(self));
        }
    }

    // ---- deadlines and timing ----

    /// Cancel the task if it is still running at `deadline`
    ///
    /// Setting a later deadline pushes the timeout back.
    pub fn set_timeout(self: &Arc<Self>, deadline: Instant) {
        self.state.lock().timeout = Some(deadline);
        match self.worker_pool() {
            Some(wp) => wp.add_reaper_hit(deadline, self),
            None => warn!(task_id = %self.id, "Timeout set on task without a worker pool"),
        }
    }

    pub fn clear_timeout(&self) {
        self.state.lock().timeout = None;
    }

    pub fn timeout(&self) -> Option<Instant> {
        self.state.lock().timeout
    }

    pub fn sw_lap(&self, label: impl Into<String>) {
        self.state.lock().stopwatch.lap(label);
    }

    pub fn laps(&self) -> Vec<Lap> {
        self.state.lock().stopwatch.laps().to_vec()
    }

    /// Time spent executing, up to now if still running
    pub fn exe_time(&self) -> Option<Duration> {
        let st = self.state.lock();
        let started = st.started_at?;
        Some(st.finished_at.unwrap_or_else(Instant::now) - started)
    }

    /// Time spent waiting in the queue, up to now if not started
    pub fn queue_time(&self) -> Option<Duration> {
        let st = self.state.lock();
        let queued = st.queued_at?;
        Some(st.started_at.unwrap_or_else(Instant::now) - queued)
    }

    // ---- waiting ----

    /// Resolves once the task has exited
    pub async fn wait(&self) {
        let gate = {
            let st = self.state.lock();
            if st.queue_state == QueueState::Exited {
                return;
            }
            st.gate.clone()
        };
        gate.wait().await;
    }

    /// Cancel the current run, wait for it, then run the task again
    /// on the same pool with a clean result
    ///
    /// If the task cannot be queued again, for example because its pool is
    /// already closed, it keeps the outcome of the previous run.
    pub async fn clear_and_recompute(self: &Arc<Self>) -> Result<(), SchedulingError> {
        self.cancel();
        self.wait().await;

        let wp = self.worker_pool().ok_or(SchedulingError::NotRunning)?;
        let was_tracked = wp.claim_task(self)?;

        let (pool, mut previous) = {
            let mut st = self.state.lock();
            let Some(pool) = st.pool.clone() else {
                drop(st);
                if !was_tracked {
                    wp.untrack_task(self);
                }
                return Err(SchedulingError::NotRunning);
            };
            let mut fresh = TaskState::new();
            fresh.pool = Some(pool.clone());
            fresh.child_pool = st.child_pool.take();
            fresh.result_callback = st.result_callback.take();
            (pool, std::mem::replace(&mut *st, fresh))
        };

        debug!(task_id = %self.id, job_name = %self.job.name, "Recomputing task");
        if let Err(err) = pool.queue_task(self) {
            warn!(task_id = %self.id, error = %err, "Recompute refused, keeping previous run");
            let fresh_gate = {
                let mut st = self.state.lock();
                previous.child_pool = st.child_pool.take();
                previous.result_callback = st.result_callback.take();
                std::mem::replace(&mut *st, previous).gate
            };
            // release anyone who started waiting on the discarded run
            fresh_gate.open();
            if !was_tracked {
                wp.untrack_task(self);
            }
            return Err(err);
        }
        Ok(())
    }

    // ---- worker side ----

    /// Bind the task to `pool` and mark it queued.
    ///
    /// Returns false when the task is already queued on that pool.
    pub(crate) fn bind_to_pool(&self, pool: &Arc<TaskPool>) -> Result<bool, SchedulingError> {
        let mut st = self.state.lock();
        if let Some(current) = &st.pool {
            if !Arc::ptr_eq(current, pool) {
                return Err(SchedulingError::AlreadyQueued {
                    task_id: self.id.clone(),
                    pool_id: current.id().to_string(),
                });
            }
            if st.queue_state != QueueState::PreQueued {
                return Ok(false);
            }
        }
        if st.error.is_some() {
            return Err(SchedulingError::PreviousError(self.id.clone()));
        }

        st.pool = Some(pool.clone());
        st.queue_state = QueueState::InQueue;
        st.queued_at = Some(Instant::now());
        st.stopwatch.lap("queued");
        Ok(true)
    }

    /// Mark the task executing. Returns false if it already has an outcome.
    pub(crate) fn begin_execution(&self, worker_id: u64) -> bool {
        let mut st = self.state.lock();
        st.worker_id = Some(worker_id);
        st.queue_state = QueueState::Executing;
        st.started_at = Some(Instant::now());
        st.stopwatch.lap("started");
        !st.exit_status.is_terminal()
    }

    /// Force success if nothing was reported and take the hooks
    pub(crate) fn take_finalizers(&self) -> Finalizers {
        let mut st = self.state.lock();
        if !st.exit_status.is_terminal() {
            trace!(task_id = %self.id, "Task closed by worker pool without a reported outcome");
            st.exit_status = ExitStatus::Success;
        }
        st.finalized = true;
        Finalizers {
            status: st.exit_status,
            result: st.result.clone(),
            post_action: st.post_action.take(),
            cleanups: std::mem::take(&mut st.cleanups),
            error_cleanups: std::mem::take(&mut st.error_cleanups),
        }
    }

    /// Run the hooks taken by [`take_finalizers`](Self::take_finalizers)
    pub(crate) fn run_finalizers(&self, finalizers: Finalizers) {
        let Finalizers {
            status,
            result,
            post_action,
            cleanups,
            error_cleanups,
        } = finalizers;

        if matches!(status, ExitStatus::Error | ExitStatus::Canceled) {
            for cleanup in error_cleanups {
                run_hook(&self.id, "error_cleanup", || cleanup(self));
            }
        }
        for cleanup in cleanups {
            run_hook(&self.id, "cleanup", || cleanup(self));
        }
        if status == ExitStatus::Success {
            if let Some(action) = post_action {
                run_hook(&self.id, "post_action", || action(result));
            }
        }
    }

    /// Mark the task exited and release waiters
    pub(crate) fn mark_exited(&self) {
        let gate = {
            let mut st = self.state.lock();
            st.queue_state = QueueState::Exited;
            st.finished_at = Some(Instant::now());
            st.stopwatch.stop();
            st.gate.clone()
        };
        gate.open();
    }

    /// Result plus bookkeeping fields, for lifecycle events
    pub(crate) fn event_payload(&self) -> TaskResult {
        let st = self.state.lock();
        let mut payload = st.result.clone();
        payload.insert("task_id".to_string(), Value::from(self.id.clone()));
        payload.insert("job_name".to_string(), Value::from(self.job.name.clone()));
        payload.insert(
            "exit_status".to_string(),
            Value::from(st.exit_status.as_str()),
        );
        if let (Some(started), Some(finished)) = (st.started_at, st.finished_at) {
            payload.insert(
                "exe_time_ms".to_string(),
                Value::from((finished - started).as_millis() as u64),
            );
        }
        if let Some(err) = &st.error {
            payload.insert("error".to_string(), Value::from(err.to_string()));
        }
        payload
    }
}

fn run_hook(task_id: &str, hook: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(
            task_id,
            hook,
            message = %panic_message(panic.as_ref()),
            "Task hook panicked"
        );
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (exited, status) = self.status();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job_name", &self.job.name)
            .field("exited", &exited)
            .field("exit_status", &status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobRegistry;

    struct PathMeta(&'static str);

    impl TaskMetadata for PathMeta {
        fn job_name(&self) -> &str {
            "move_file"
        }

        fn meta_string(&self) -> String {
            self.0.to_string()
        }
    }

    fn detached_task() -> Arc<Task> {
        let registry = JobRegistry::new();
        registry.register("move_file", |_task| async { Ok(()) }, JobOptions::new());
        let job = registry.get("move_file").unwrap();
        Task::new(
            "abcd1234".to_string(),
            job,
            Arc::new(PathMeta("/media/a.jpg")),
            Weak::new(),
        )
    }

    #[test]
    fn test_new_task_state() {
        let task = detached_task();
        assert_eq!(task.id(), "abcd1234");
        assert_eq!(task.job_name(), "move_file");
        assert_eq!(task.status(), (false, ExitStatus::None));
        assert_eq!(task.queue_state(), QueueState::PreQueued);
        assert!(task.read_error().is_none());
        assert!(task.task_pool().is_none());
        assert_eq!(task.meta::<PathMeta>().unwrap().0, "/media/a.jpg");
    }

    #[test]
    fn test_cancel_marks_canceled_but_not_exited() {
        let task = detached_task();
        task.cancel();

        assert_eq!(task.status(), (false, ExitStatus::Canceled));
        assert!(task.is_signaled());
        assert_eq!(task.check_exit(), Err(TaskExit::Canceled));
        assert!(matches!(task.read_error(), Some(JobError::Canceled)));
    }

    #[test]
    fn test_terminal_status_is_not_overwritten() {
        let task = detached_task();
        task.success();
        assert_eq!(task.fail(anyhow::anyhow!("late failure")), TaskExit::Failed);
        task.cancel();

        assert_eq!(task.status().1, ExitStatus::Success);
        assert!(!task.is_signaled());
        assert!(task.read_error().is_none());
    }

    #[test]
    fn test_success_with_message() {
        let task = detached_task();
        task.success_with("3 files indexed");
        task.success_with("ignored");

        assert_eq!(task.status(), (false, ExitStatus::Success));
        assert_eq!(task.get_result("message"), Some(Value::from("3 files indexed")));
    }

    #[test]
    fn test_fail_after_cancel_reports_canceled() {
        let task = detached_task();
        task.cancel();
        assert_eq!(task.fail(anyhow::anyhow!("io error")), TaskExit::Canceled);
        assert_eq!(task.status().1, ExitStatus::Canceled);
    }

    #[test]
    fn test_req_no_err() {
        let task = detached_task();
        let ok: Result<u32, std::io::Error> = Ok(3);
        assert_eq!(task.req_no_err(ok), Ok(3));

        let err: Result<u32, std::io::Error> = Err(std::io::Error::other("gone"));
        assert_eq!(task.req_no_err(err), Err(TaskExit::Failed));
        assert_eq!(task.status().1, ExitStatus::Error);
        assert!(task.read_error().unwrap().to_string().contains("gone"));
    }

    #[test]
    fn test_results_and_callback() {
        let task = detached_task();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        task.on_result(move |result| sink.lock().push(result.len()));

        task.set_result("bytes", 1024);
        task.set_result("files", 3);

        assert_eq!(task.get_result("bytes"), Some(Value::from(1024)));
        assert_eq!(task.get_results().len(), 2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_finalizers_order() {
        let task = detached_task();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        task.set_cleanup(move |_| o.lock().push("cleanup"));
        let o = order.clone();
        task.set_error_cleanup(move |_| o.lock().push("error_cleanup"));
        let o = order.clone();
        task.set_post_action(move |_| o.lock().push("post_action"));

        task.fail(anyhow::anyhow!("nope"));
        let finalizers = task.take_finalizers();
        task.run_finalizers(finalizers);

        assert_eq!(*order.lock(), vec!["error_cleanup", "cleanup"]);
    }

    #[test]
    fn test_post_action_after_finalize_runs_inline() {
        let task = detached_task();
        task.set_result("sum", 5);
        let finalizers = task.take_finalizers();
        task.run_finalizers(finalizers);
        task.mark_exited();
        assert_eq!(task.status(), (true, ExitStatus::Success));

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        task.set_post_action(move |result| *sink.lock() = result.get("sum").cloned());
        assert_eq!(*seen.lock(), Some(Value::from(5)));
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let task = detached_task();
        let ran = Arc::new(Mutex::new(false));
        task.set_cleanup(|_| panic!("cleanup exploded"));
        let flag = ran.clone();
        task.set_cleanup(move |_| *flag.lock() = true);

        let finalizers = task.take_finalizers();
        task.run_finalizers(finalizers);
        assert!(*ran.lock());
    }

    #[tokio::test]
    async fn test_wait_after_exit_returns() {
        let task = detached_task();
        task.begin_execution(1);
        let finalizers = task.take_finalizers();
        task.run_finalizers(finalizers);
        task.mark_exited();

        for _ in 0..3 {
            task.wait().await;
            assert_eq!(task.status(), (true, ExitStatus::Success));
        }
        assert!(task.exe_time().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let task = detached_task();
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.cancelled().await })
        };
        tokio::task::yield_now().await;
        task.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() resolved")
            .unwrap();
    }

    #[test]
    fn test_begin_execution_skips_canceled() {
        let task = detached_task();
        task.cancel();
        assert!(!task.begin_execution(7));
        assert_eq!(task.worker_id(), Some(7));
        assert_eq!(task.queue_state(), QueueState::Executing);
    }
}
