//! The worker pool: lazily-created threads pulling from a shared queue.

use crate::queue::{RejectedError, TaskQueue};
use crate::task::{CancelToken, Task};
use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How often an idle worker re-checks the pool state while waiting.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of worker threads. Workers are created lazily as
    /// tasks arrive, up to this bound.
    pub worker_count: usize,

    /// When set, a worker idle for this long exits; when `None`, workers
    /// live until shutdown.
    pub idle_timeout: Option<Duration>,

    /// Bound on queued tasks. `None` is unbounded; with a bound, overflow
    /// rejects the submission.
    pub queue_capacity: Option<usize>,

    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            idle_timeout: None,
            queue_capacity: None,
            thread_name_prefix: "taskpool-worker".to_string(),
        }
    }
}

/// Lifecycle of a pool. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting and executing tasks.
    Running,
    /// No longer accepting; draining queued and in-flight tasks.
    ShuttingDown,
    /// No workers remain.
    Terminated,
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

struct PoolInner {
    queue: TaskQueue,
    state: AtomicU8,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    cancel: CancelToken,
    termination_lock: Mutex<()>,
    terminated: Condvar,
    config: PoolConfig,
}

/// A managed set of worker threads pulling tasks from a shared FIFO queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool. No threads are spawned until the first submission.
    pub fn with_config(config: PoolConfig) -> Self {
        info!(
            "creating worker pool (workers: {}, idle timeout: {:?}, queue capacity: {:?})",
            config.worker_count, config.idle_timeout, config.queue_capacity
        );

        Self {
            inner: Arc::new(PoolInner {
                queue: TaskQueue::new(config.queue_capacity),
                state: AtomicU8::new(RUNNING),
                live_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                cancel: CancelToken::new(),
                termination_lock: Mutex::new(()),
                terminated: Condvar::new(),
                config,
            }),
        }
    }

    /// Enqueue a task and make sure a worker will pick it up.
    pub fn submit(&self, task: Task) -> Result<(), RejectedError> {
        if self.inner.state() != PoolState::Running {
            return Err(RejectedError::ShuttingDown);
        }
        self.inner.queue.push(task)?;
        self.inner.ensure_worker();
        Ok(())
    }

    /// Stop accepting tasks. Queued and in-flight tasks run to completion.
    pub fn shutdown(&self) {
        if !self.inner.begin_shutdown() {
            return;
        }
        info!("shutting down worker pool");

        // Queued work with no live worker would never drain; make sure at
        // least one worker exists to finish the backlog.
        if !self.inner.queue.is_empty() {
            self.inner.ensure_worker();
        }
        if self.inner.live_workers.load(Ordering::SeqCst) == 0 && self.inner.queue.is_empty() {
            self.inner.mark_terminated();
        }
    }

    /// Stop accepting tasks, signal cancellation to in-flight tasks, and
    /// return every task that was queued but never started.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let first = self.inner.begin_shutdown();
        if first {
            info!("shutting down worker pool immediately");
        }
        self.inner.cancel.cancel();
        let drained = self.inner.queue.drain();
        if self.inner.live_workers.load(Ordering::SeqCst) == 0 {
            self.inner.mark_terminated();
        }
        debug!("drained {} unexecuted tasks", drained.len());
        drained
    }

    /// Block until the pool is terminated or `timeout` elapses. Returns
    /// whether termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.termination_lock.lock();
        while self.inner.state() != PoolState::Terminated {
            // A backlog with no live worker cannot drain itself. That state
            // is only reachable when every spawn attempt failed, and after
            // shutdown the retry-on-submission path is closed, so retry the
            // spawn from here.
            if self.inner.live_workers.load(Ordering::SeqCst) == 0
                && !self.inner.queue.is_empty()
            {
                self.inner.ensure_worker();
            }
            if self
                .inner
                .terminated
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.inner.state() == PoolState::Terminated;
            }
        }
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// The pool-wide cancellation token. Tripped by `shutdown_now`;
    /// per-task tokens are derived from it.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => PoolState::Running,
            SHUTTING_DOWN => PoolState::ShuttingDown,
            _ => PoolState::Terminated,
        }
    }

    /// `Running -> ShuttingDown`. Returns whether this call made the
    /// transition.
    fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_terminated(&self) {
        let _guard = self.termination_lock.lock();
        self.state.store(TERMINATED, Ordering::SeqCst);
        info!("worker pool terminated");
        self.terminated.notify_all();
    }

    /// Spawn a worker if no idle worker exists and the bound allows one.
    ///
    /// A failed spawn is not fatal to the pool: the task stays queued, the
    /// pool keeps the workers it has, and creation is retried on the next
    /// submission.
    fn ensure_worker(self: &Arc<Self>) {
        if self.idle_workers.load(Ordering::SeqCst) > 0 {
            return;
        }
        loop {
            let live = self.live_workers.load(Ordering::SeqCst);
            if live >= self.config.worker_count {
                return;
            }
            if self
                .live_workers
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}", self.config.thread_name_prefix, id);
        let inner = Arc::clone(self);

        if let Err(e) = thread::Builder::new()
            .name(name)
            .spawn(move || inner.worker_loop(id))
        {
            error!("failed to spawn worker {}: {}", id, e);
            self.live_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn worker_loop(self: Arc<Self>, id: usize) {
        debug!("worker {}: starting", id);
        let mut idle_since = Instant::now();

        loop {
            self.idle_workers.fetch_add(1, Ordering::SeqCst);
            let received = self.queue.recv_timeout(SHUTDOWN_POLL);
            self.idle_workers.fetch_sub(1, Ordering::SeqCst);

            match received {
                Ok(task) => {
                    trace!("worker {}: executing {}", id, task.id());
                    // The recovery boundary lives inside the task wiring;
                    // run() never unwinds into the worker loop.
                    task.run();
                    idle_since = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.state() != PoolState::Running && self.queue.is_empty() {
                        break;
                    }
                    if let Some(limit) = self.config.idle_timeout {
                        if self.state() == PoolState::Running
                            && idle_since.elapsed() >= limit
                            && self.queue.is_empty()
                        {
                            debug!("worker {}: idle timeout, exiting", id);
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let remaining = self.live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("worker {}: exiting ({} workers remain)", id, remaining);
        if self.state() == PoolState::Running && !self.queue.is_empty() {
            // A task slipped in between the idle check and the exit; make
            // sure someone is around to run it.
            self.ensure_worker();
        } else if remaining == 0 && self.state() != PoolState::Running && self.queue.is_empty() {
            self.mark_terminated();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{logging_sink, TaskId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_task(id: u64, counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Task::action(TaskId(id), CancelToken::new(), logging_sink(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_pool_runs_tasks() {
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: 2,
            ..Default::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for id in 0..10 {
            pool.submit(counting_task(id, &counter)).unwrap();
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_fixed_pool_caps_concurrency() {
        let n = 2;
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: n,
            ..Default::default()
        });

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for id in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            let task = Task::action(TaskId(id), CancelToken::new(), logging_sink(), move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            pool.submit(task).unwrap();
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= n);
        assert!(pool.worker_count() <= n);
    }

    #[test]
    fn test_workers_spawn_lazily() {
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: 8,
            ..Default::default()
        });
        assert_eq!(pool.worker_count(), 0);

        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(counting_task(0, &counter)).unwrap();
        assert!(pool.worker_count() >= 1);
    }

    #[test]
    fn test_cached_pool_tears_down_idle_workers() {
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: 4,
            idle_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(counting_task(0, &counter)).unwrap();

        thread::sleep(Duration::from_millis(400));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.worker_count(), 0);

        // The pool is still running; new work respawns a worker.
        pool.submit(counting_task(1, &counter)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let pool = WorkerPool::with_config(PoolConfig::default());
        pool.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        let result = pool.submit(counting_task(0, &counter));
        assert_eq!(result, Err(RejectedError::ShuttingDown));
        assert!(pool.await_termination(Duration::from_secs(1)));
    }

    #[test]
    fn test_shutdown_now_returns_unstarted_tasks() {
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: 1,
            ..Default::default()
        });

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let gate_clone = gate.clone();
        let blocker = Task::action(TaskId(0), CancelToken::new(), logging_sink(), move |_| {
            let _g = gate_clone.lock();
            Ok(())
        });
        pool.submit(blocker).unwrap();
        thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicUsize::new(0));
        for id in 1..4 {
            pool.submit(counting_task(id, &counter)).unwrap();
        }

        let drained = pool.shutdown_now();
        let ids: Vec<u64> = drained.iter().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_await_termination_drains_backlog_with_no_workers() {
        let pool = WorkerPool::with_config(PoolConfig {
            worker_count: 1,
            ..Default::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        // A queued task with no live worker: the state a failed spawn
        // leaves behind. After shutdown, submission-side retries are no
        // longer possible, so the termination wait must respawn.
        pool.inner.queue.push(counting_task(0, &counter)).unwrap();
        assert_eq!(pool.worker_count(), 0);
        assert!(pool.inner.begin_shutdown());

        assert!(pool.await_termination(Duration::from_secs(2)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_await_termination_times_out_while_running() {
        let pool = WorkerPool::with_config(PoolConfig::default());
        assert!(!pool.await_termination(Duration::from_millis(30)));
        assert_eq!(pool.state(), PoolState::Running);
    }
}
