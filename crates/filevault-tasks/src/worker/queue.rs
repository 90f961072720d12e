//! Bounded shared task queue

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::Task;

/// FIFO queue shared by every worker
pub(crate) struct TaskQueue {
    items: Mutex<VecDeque<Arc<Task>>>,
    capacity: usize,
    notify: Notify,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Push without blocking. Hands the task back when the queue is full.
    pub(crate) fn try_push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(task);
            }
            items.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Move tasks from the front of `tasks` until the queue is full.
    /// Returns how many moved.
    pub(crate) fn push_from(&self, tasks: &mut Vec<Arc<Task>>) -> usize {
        let moved = {
            let mut items = self.items.lock();
            let room = self.capacity.saturating_sub(items.len());
            let moved = room.min(tasks.len());
            items.extend(tasks.drain(..moved));
            moved
        };
        for _ in 0..moved {
            self.notify.notify_one();
        }
        moved
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<Task>> {
        let mut items = self.items.lock();
        let task = items.pop_front();
        if task.is_some() && !items.is_empty() {
            // pass the wakeup along so queued work does not sit behind one permit
            self.notify.notify_one();
        }
        task
    }

    /// Wait for the next task
    pub(crate) async fn pop(&self) -> Arc<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_pop() {
                return task;
            }
            notified.await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
