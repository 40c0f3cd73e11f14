//! The ordered buffer between submitters and workers.
//!
//! Producers (callers) and consumers (workers) share the queue concurrently;
//! ordering is FIFO. The queue is unbounded by default. With an explicit
//! capacity, overflow rejects the submission rather than blocking the
//! submitter.

use crate::task::Task;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;
use thiserror::Error;

/// Why a submission was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectedError {
    /// The executor no longer accepts tasks.
    #[error("executor is shutting down")]
    ShuttingDown,

    /// The queue capacity bound was reached.
    #[error("task queue is full")]
    QueueFull,
}

/// FIFO buffer of tasks awaiting a worker.
pub struct TaskQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl TaskQueue {
    /// Create a queue, bounded when `capacity` is given.
    pub fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(n) => bounded(n),
            None => unbounded(),
        };
        Self { sender, receiver }
    }

    /// Enqueue a task without blocking.
    pub fn push(&self, task: Task) -> Result<(), RejectedError> {
        match self.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RejectedError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(RejectedError::ShuttingDown),
        }
    }

    /// Wait up to `timeout` for the next task.
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Task, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Remove and return every task currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<Task> {
        self.receiver.try_iter().collect()
    }

    /// Number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{logging_sink, CancelToken, Task, TaskId};

    fn noop_task(id: u64) -> Task {
        Task::action(TaskId(id), CancelToken::new(), logging_sink(), |_| Ok(()))
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(None);
        for id in 0..5 {
            queue.push(noop_task(id)).unwrap();
        }

        let drained = queue.drain();
        let ids: Vec<u64> = drained.iter().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_queue_rejects_overflow() {
        let queue = TaskQueue::new(Some(2));
        queue.push(noop_task(1)).unwrap();
        queue.push(noop_task(2)).unwrap();

        let result = queue.push(noop_task(3));
        assert_eq!(result, Err(RejectedError::QueueFull));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_recv_timeout_empty() {
        let queue = TaskQueue::new(None);
        let result = queue.recv_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(RecvTimeoutError::Timeout)));
    }
}
