//! The base executor: decouples task submission from thread management.

use crate::future::TaskFuture;
use crate::pool::{PoolConfig, PoolState, WorkerPool};
use crate::queue::RejectedError;
use crate::task::{logging_sink, CancelToken, ErrorSink, Task, TaskError, TaskId};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for an [`Executor`].
///
/// The named pool disciplines are plain constructors over this struct;
/// there are no hidden global defaults.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of worker threads.
    pub worker_count: usize,

    /// Idle teardown delay for workers; `None` keeps workers until shutdown.
    pub idle_timeout: Option<Duration>,

    /// Bound on queued tasks; overflow rejects the submission.
    pub queue_capacity: Option<usize>,

    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
}

impl ExecutorConfig {
    /// A fixed pool of `worker_count` threads, kept alive until shutdown.
    pub fn fixed(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// An unbounded pool that grows on demand and tears workers down after
    /// 60 seconds of idleness.
    ///
    /// Good for short, high-concurrency bursts. Under sustained load the
    /// thread count grows without bound; that resource-exhaustion risk is
    /// inherent to the discipline, not guarded against here.
    pub fn cached() -> Self {
        Self {
            worker_count: usize::MAX,
            idle_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    /// A single worker. Tasks execute strictly in submission order, never
    /// concurrently with each other.
    pub fn single_worker() -> Self {
        Self {
            worker_count: 1,
            ..Default::default()
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            idle_timeout: None,
            queue_capacity: None,
            thread_name_prefix: "taskpool-worker".to_string(),
        }
    }
}

/// The public submission façade over a worker pool.
///
/// Tasks are either fire-and-forget actions ([`execute`](Executor::execute))
/// or result-producing computations ([`submit`](Executor::submit)). Either
/// way the call returns immediately; execution happens on pool workers.
pub struct Executor {
    pool: WorkerPool,
    sink: ErrorSink,
    next_task_id: AtomicU64,
}

impl Executor {
    /// Create an executor; failures of fire-and-forget tasks go to the
    /// logging sink.
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self::with_error_sink(config, logging_sink())
    }

    /// Create an executor with an injected error sink for fire-and-forget
    /// failures.
    pub fn with_error_sink(config: ExecutorConfig, sink: ErrorSink) -> Self {
        info!("creating executor with {} max workers", config.worker_count);
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: config.worker_count,
            idle_timeout: config.idle_timeout,
            queue_capacity: config.queue_capacity,
            thread_name_prefix: config.thread_name_prefix,
        });
        Self {
            pool,
            sink,
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Submit a fire-and-forget action.
    ///
    /// Returns the task's identity immediately; completion is not reported.
    /// A failing or panicking body is routed to the error sink under that
    /// identity, never dropped and never fatal to the worker.
    pub fn execute<F>(&self, f: F) -> Result<TaskId, RejectedError>
    where
        F: FnOnce(&CancelToken) -> Result<(), TaskError> + Send + 'static,
    {
        let id = self.next_id();
        let token = self.pool.cancel_token().child();
        let task = Task::action(id, token, self.sink.clone(), f);
        self.pool.submit(task)?;
        Ok(id)
    }

    /// Submit a result-producing computation.
    ///
    /// The returned future transitions to completed or failed when the task
    /// finishes; cancelling it prevents a not-yet-started task from running.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        let id = self.next_id();
        let token = self.pool.cancel_token().child();
        let future = TaskFuture::pending(token.clone());
        let task = Task::computation(id, token, &future, f);
        self.pool.submit(task)?;
        Ok(future)
    }

    /// Stop accepting tasks; queued and in-flight tasks run to completion.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Stop accepting tasks, signal cancellation to in-flight tasks, and
    /// return the tasks that were queued but never started.
    ///
    /// Cancellation is cooperative: an in-flight task only stops if it
    /// checks its token.
    pub fn shutdown_now(&self) -> Vec<Task> {
        self.pool.shutdown_now()
    }

    /// Block until the pool terminates or `timeout` elapses; returns
    /// whether termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.pool.await_termination(timeout)
    }

    /// Whether the executor has stopped accepting tasks.
    pub fn is_shutdown(&self) -> bool {
        self.pool.state() != PoolState::Running
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        self.pool.cancel_token()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureError;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_submit_round_trips_value() {
        let executor = Executor::with_config(ExecutorConfig::fixed(2));

        let future = executor.submit(|_| Ok(6 * 7)).unwrap();
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn test_submit_captures_failure() {
        let executor = Executor::with_config(ExecutorConfig::fixed(1));

        let future: crate::future::TaskFuture<u32> = executor
            .submit(|_| Err(TaskError::Failed("bad input".into())))
            .unwrap();
        assert!(matches!(
            future.get(),
            Err(FutureError::Failed(TaskError::Failed(_)))
        ));

        let future: crate::future::TaskFuture<u32> =
            executor.submit(|_| panic!("boom")).unwrap();
        match future.get() {
            Err(FutureError::Failed(TaskError::Panicked(msg))) => {
                assert!(msg.contains("boom"));
            }
            other => panic!("expected panic capture, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_execute_failure_reaches_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: ErrorSink = Arc::new(move |id, err| {
            seen_clone.lock().push((id, err.clone()));
        });

        let executor = Executor::with_error_sink(ExecutorConfig::fixed(1), sink);
        let id = executor
            .execute(|_| Err(TaskError::Failed("broken".into())))
            .unwrap();

        executor.shutdown();
        assert!(executor.await_termination(Duration::from_secs(2)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, id);
        assert_eq!(seen[0].1, TaskError::Failed("broken".into()));
    }

    #[test]
    fn test_worker_survives_task_panic() {
        let executor = Executor::with_config(ExecutorConfig::fixed(1));

        executor.execute(|_| panic!("first task panics")).unwrap();
        let future = executor.submit(|_| Ok("still alive")).unwrap();
        assert_eq!(future.get().unwrap(), "still alive");
    }

    #[test]
    fn test_single_worker_preserves_submission_order() {
        let executor = Executor::with_config(ExecutorConfig::single_worker());
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20u32 {
            let order = order.clone();
            executor
                .execute(move |_| {
                    order.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }

        executor.shutdown();
        assert!(executor.await_termination(Duration::from_secs(2)));
        assert_eq!(*order.lock(), (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let executor = Executor::with_config(ExecutorConfig::fixed(2));
        executor.shutdown();

        for _ in 0..3 {
            let result = executor.submit(|_| Ok(1));
            assert!(matches!(result, Err(RejectedError::ShuttingDown)));
            let result = executor.execute(|_| Ok(()));
            assert!(matches!(result, Err(RejectedError::ShuttingDown)));
        }
        assert!(executor.is_shutdown());
    }

    #[test]
    fn test_shutdown_now_cancels_queued_computations() {
        let executor = Executor::with_config(ExecutorConfig::fixed(1));

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let gate_clone = gate.clone();
        executor
            .execute(move |_| {
                let _g = gate_clone.lock();
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let queued = executor.submit(|_| Ok(5)).unwrap();
        let drained = executor.shutdown_now();
        assert_eq!(drained.len(), 1);
        drop(held);

        // Running the drained task now reports cancellation through the
        // future, because the pool token was tripped.
        for task in drained {
            task.run();
        }
        assert!(matches!(queued.get(), Err(FutureError::Cancelled)));
    }

    #[test]
    fn test_cancelled_future_skips_execution() {
        let executor = Executor::with_config(ExecutorConfig::fixed(1));

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let gate_clone = gate.clone();
        executor
            .execute(move |_| {
                let _g = gate_clone.lock();
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let future = executor
            .submit(move |_| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .unwrap();

        assert!(future.cancel());
        drop(held);

        executor.shutdown();
        assert!(executor.await_termination(Duration::from_secs(2)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(matches!(future.get(), Err(FutureError::Cancelled)));
    }

    #[test]
    fn test_cached_executor_runs_bursts() {
        let executor = Executor::with_config(ExecutorConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ExecutorConfig::cached()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                executor
                    .submit(move |_| {
                        thread::sleep(Duration::from_millis(10));
                        Ok(counter.fetch_add(1, Ordering::SeqCst))
                    })
                    .unwrap()
            })
            .collect();

        for future in futures {
            future.get().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
