//! Overflow buffer for tasks that did not fit on the shared queue

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::queue::TaskQueue;
use crate::config::MIN_INTERVAL;
use crate::task::Task;

/// Unbounded FIFO of tasks waiting for queue space
#[derive(Default)]
pub(crate) struct RetryBuffer {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl RetryBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push onto `queue` if the buffer is empty and the queue has room,
    /// otherwise buffer the task. Never blocks on queue space.
    pub(crate) fn offer(&self, queue: &TaskQueue, task: Arc<Task>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tasks.push(task);
            return;
        }
        if let Err(task) = queue.try_push(task) {
            debug!(task_id = %task.id(), "Shared queue full, buffering task");
            tasks.push(task);
        }
    }

    pub(crate) fn push(&self, task: Arc<Task>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn extend(&self, more: impl IntoIterator<Item = Arc<Task>>) {
        self.tasks.lock().extend(more);
    }

    /// Empty the buffer, oldest first
    pub(crate) fn take_all(&self) -> Vec<Arc<Task>> {
        std::mem::take(&mut *self.tasks.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Move as much of the buffer as fits, but only once the queue has
    /// run dry. Returns how many moved.
    pub(crate) fn drain_into(&self, queue: &TaskQueue) -> usize {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() || !queue.is_empty() {
            return 0;
        }
        queue.push_from(&mut tasks)
    }
}

/// Periodically flush the retry buffer onto the queue
pub(crate) async fn run_drainer(
    buffer: Arc<RetryBuffer>,
    queue: Arc<TaskQueue>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let moved = buffer.drain_into(&queue);
                if moved > 0 {
                    debug!(moved, remaining = buffer.len(), "Flushed retry buffer");
                }
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("Retry drainer: shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::detached_task;

    #[test]
    fn test_offer_prefers_queue() {
        let queue = TaskQueue::new(1);
        let buffer = RetryBuffer::new();

        buffer.offer(&queue, detached_task("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(buffer.len(), 0);

        buffer.offer(&queue, detached_task("b"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_offer_keeps_order_while_buffering() {
        let queue = TaskQueue::new(1);
        let buffer = RetryBuffer::new();
        buffer.push(detached_task("first"));

        // queue has room, but the buffer is not empty
        buffer.offer(&queue, detached_task("second"));
        assert_eq!(queue.len(), 0);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drain_only_when_queue_empty() {
        let queue = TaskQueue::new(2);
        let buffer = RetryBuffer::new();
        queue.try_push(detached_task("busy")).unwrap();
        buffer.extend(["a", "b", "c"].into_iter().map(detached_task));

        assert_eq!(buffer.drain_into(&queue), 0);

        queue.try_pop();
        assert_eq!(buffer.drain_into(&queue), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(queue.try_pop().unwrap().id(), "a");
        assert_eq!(queue.try_pop().unwrap().id(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drainer_flushes_on_tick() {
        let queue = Arc::new(TaskQueue::new(4));
        let buffer = Arc::new(RetryBuffer::new());
        buffer.extend(["a", "b"].into_iter().map(detached_task));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drainer = tokio::spawn(run_drainer(
            buffer.clone(),
            queue.clone(),
            Duration::from_secs(10),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(buffer.len(), 0);

        shutdown_tx.send(true).unwrap();
        drainer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drainer_survives_zero_interval() {
        let queue = Arc::new(TaskQueue::new(1));
        let buffer = Arc::new(RetryBuffer::new());
        buffer.extend(["a", "b"].into_iter().map(detached_task));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drainer = tokio::spawn(run_drainer(
            buffer.clone(),
            queue.clone(),
            Duration::ZERO,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.try_pop().unwrap().id(), "a");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.try_pop().unwrap().id(), "b");
        assert_eq!(buffer.len(), 0);

        shutdown_tx.send(true).unwrap();
        drainer.await.unwrap();
    }
}
