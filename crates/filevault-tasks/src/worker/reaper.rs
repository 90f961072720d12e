//! Deadline enforcement
//!
//! Tasks register `(deadline, task)` hits. Each hit arms a timer; when it
//! fires the task is canceled with [`JobError::Timeout`] if it is still
//! running and its current deadline has passed. Pushing a deadline back
//! registers a new hit, and the stale timer finds nothing to do.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::task::Task;

/// A deadline registration
pub(crate) struct Hit {
    pub(crate) deadline: Instant,
    pub(crate) task: Weak<Task>,
}

impl Hit {
    pub(crate) fn new(deadline: Instant, task: &Arc<Task>) -> Self {
        Self {
            deadline,
            task: Arc::downgrade(task),
        }
    }
}

/// Receive hits and arm a timer for each
pub(crate) async fn run_reaper(
    mut hits: mpsc::UnboundedReceiver<Hit>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // `shutdown_rx` stays mutably borrowed by the select below
    let timer_rx = shutdown_rx.clone();
    loop {
        tokio::select! {
            hit = hits.recv() => {
                let Some(hit) = hit else { break };
                tokio::spawn(arm(hit, timer_rx.clone()));
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("Reaper: shutdown requested");
                break;
            }
        }
    }
}

async fn arm(hit: Hit, mut shutdown_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep_until(hit.deadline) => {
            if let Some(task) = hit.task.upgrade() {
                reap(&task);
            }
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {}
    }
}

/// Cancel `task` if it is still running past its deadline
pub(crate) fn reap(task: &Task) -> bool {
    if task.is_exited() {
        return false;
    }
    match task.timeout() {
        Some(deadline) if Instant::now() >= deadline => {
            warn!(
                task_id = %task.id(),
                job_name = %task.job_name(),
                "Task exceeded its deadline, canceling"
            );
            task.cancel_with(JobError::Timeout);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExitStatus;
    use crate::test_support::detached_task;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_reap_past_deadline() {
        let task = detached_task("slow");
        task.begin_execution(1);
        // no worker pool: set the deadline directly
        task.set_timeout(Instant::now() + Duration::from_millis(50));

        assert!(!reap(&task));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(reap(&task));

        assert_eq!(task.status(), (false, ExitStatus::Canceled));
        assert!(task.read_error().unwrap().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_timeout_is_ignored() {
        let task = detached_task("slow");
        task.set_timeout(Instant::now() + Duration::from_millis(10));
        task.clear_timeout();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(!reap(&task));
        assert_eq!(task.status().1, ExitStatus::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_hit_cancels() {
        let task = detached_task("slow");
        task.set_timeout(Instant::now() + Duration::from_millis(30));

        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_reaper(rx, shutdown_rx));
        tx.send(Hit::new(task.timeout().unwrap(), &task)).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(task.is_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_timers_on_shutdown() {
        let task = detached_task("slow");
        task.set_timeout(Instant::now() + Duration::from_millis(30));

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(run_reaper(rx, shutdown_rx));
        tx.send(Hit::new(task.timeout().unwrap(), &task)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        shutdown_tx.send(true).unwrap();
        reaper.await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!task.is_signaled());
    }
}
