//! Work-stealing executor: per-worker deques with idle-time stealing.
//!
//! Each worker owns a Chase-Lev deque. It pushes and pops its own end LIFO
//! (cache-friendly) and, when empty, steals FIFO from the opposite end of a
//! peer's deque, walking the peers round-robin from its own index. External
//! submissions go through a shared injector that idle workers batch-steal
//! from. Idle workers self-balance load without a central dispatcher, which
//! is what makes this pool the right fit for unevenly-sized task bursts.

use crate::future::TaskFuture;
use crate::pool::PoolState;
use crate::queue::RejectedError;
use crate::task::{logging_sink, CancelToken, ErrorSink, Task, TaskError, TaskId};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use crossbeam_utils::sync::{Parker, Unparker};
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a [`WorkStealingExecutor`].
#[derive(Debug, Clone)]
pub struct StealConfig {
    /// Number of worker threads. Defaults to the number of available
    /// processing units.
    pub parallelism: usize,

    /// Spin iterations before an idle worker parks.
    pub spin_iters: u32,

    /// Park duration between idle re-checks. Submissions unpark a worker
    /// directly; the timeout only bounds how long a race can go unnoticed.
    pub park_timeout: Duration,

    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
}

impl Default for StealConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            spin_iters: 64,
            park_timeout: Duration::from_millis(10),
            thread_name_prefix: "taskpool-steal".to_string(),
        }
    }
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

struct StealShared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    state: AtomicU8,
    cancel: CancelToken,
    live_workers: AtomicUsize,
    termination_lock: Mutex<()>,
    terminated: Condvar,
    config: StealConfig,
}

impl StealShared {
    fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => PoolState::Running,
            SHUTTING_DOWN => PoolState::ShuttingDown,
            _ => PoolState::Terminated,
        }
    }

    fn unpark_one(&self) {
        let n = self.unparkers.len();
        if n == 0 {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.unparkers[idx].unpark();
    }

    fn unpark_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }

    fn mark_terminated(&self) {
        let _guard = self.termination_lock.lock();
        self.state.store(TERMINATED, Ordering::SeqCst);
        info!("work-stealing executor terminated");
        self.terminated.notify_all();
    }

    /// Run everything still sitting in the injector on the current thread.
    fn drain_and_run(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => task.run(),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
}

/// A worker-pool executor where idle workers steal from busy peers.
pub struct WorkStealingExecutor {
    shared: Arc<StealShared>,
    sink: ErrorSink,
    next_task_id: AtomicU64,
}

impl WorkStealingExecutor {
    /// Create the executor and start its workers; failures of
    /// fire-and-forget tasks go to the logging sink.
    pub fn with_config(config: StealConfig) -> Self {
        Self::with_error_sink(config, logging_sink())
    }

    /// Create the executor with an injected error sink.
    pub fn with_error_sink(config: StealConfig, sink: ErrorSink) -> Self {
        let parallelism = config.parallelism.max(1);
        info!(
            "creating work-stealing executor with parallelism {}",
            parallelism
        );

        let mut locals = Vec::with_capacity(parallelism);
        let mut stealers = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            let queue = WorkerQueue::new_lifo();
            stealers.push(queue.stealer());
            locals.push(queue);
        }

        let mut parkers = Vec::with_capacity(parallelism);
        let mut unparkers = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let shared = Arc::new(StealShared {
            injector: Injector::new(),
            stealers,
            unparkers,
            next_unpark: AtomicUsize::new(0),
            state: AtomicU8::new(RUNNING),
            cancel: CancelToken::new(),
            live_workers: AtomicUsize::new(parallelism),
            termination_lock: Mutex::new(()),
            terminated: Condvar::new(),
            config: config.clone(),
        });

        for (index, (local, parker)) in locals.drain(..).zip(parkers.drain(..)).enumerate() {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || worker_loop(shared, local, parker, index))
                .expect("failed to spawn worker thread");
        }

        Self {
            shared,
            sink,
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Submit a fire-and-forget action; failures go to the error sink.
    pub fn execute<F>(&self, f: F) -> Result<TaskId, RejectedError>
    where
        F: FnOnce(&CancelToken) -> Result<(), TaskError> + Send + 'static,
    {
        let id = self.next_id();
        let token = self.shared.cancel.child();
        self.push_task(Task::action(id, token, self.sink.clone(), f))?;
        Ok(id)
    }

    /// Submit a result-producing computation and return its future
    /// immediately.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        let id = self.next_id();
        let token = self.shared.cancel.child();
        let future = TaskFuture::pending(token.clone());
        self.push_task(Task::computation(id, token, &future, f))?;
        Ok(future)
    }

    /// Batch/barrier submission: submit every computation, then block until
    /// all of them reach a terminal state. Every returned future is
    /// immediately retrievable.
    pub fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<TaskFuture<T>>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        let futures = tasks
            .into_iter()
            .map(|f| self.submit(f))
            .collect::<Result<Vec<_>, _>>()?;
        for future in &futures {
            future.wait();
        }
        Ok(futures)
    }

    /// Stop accepting tasks; queued and in-flight tasks run to completion.
    pub fn shutdown(&self) {
        if self.begin_shutdown() {
            info!("shutting down work-stealing executor");
        }
        self.shared.unpark_all();
    }

    /// Stop accepting tasks, signal cancellation to in-flight tasks, and
    /// return every task that was queued but never started, whether it sat
    /// in the injector or in a worker's local deque.
    pub fn shutdown_now(&self) -> Vec<Task> {
        if self.begin_shutdown() {
            info!("shutting down work-stealing executor immediately");
        }
        self.shared.cancel.cancel();

        let mut drained = Vec::new();
        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => drained.push(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        for stealer in &self.shared.stealers {
            loop {
                match stealer.steal() {
                    Steal::Success(task) => drained.push(task),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }

        self.shared.unpark_all();
        debug!("drained {} unexecuted tasks", drained.len());
        drained
    }

    /// Block until every worker has exited or `timeout` elapses; returns
    /// whether termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.termination_lock.lock();
        while self.shared.state() != PoolState::Terminated {
            if self
                .shared
                .terminated
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.shared.state() == PoolState::Terminated;
            }
        }
        true
    }

    /// Whether the executor has stopped accepting tasks.
    pub fn is_shutdown(&self) -> bool {
        self.shared.state() != PoolState::Running
    }

    /// Number of worker threads still alive.
    pub fn worker_count(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    fn begin_shutdown(&self) -> bool {
        self.shared
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn push_task(&self, task: Task) -> Result<(), RejectedError> {
        if self.shared.state() != PoolState::Running {
            return Err(RejectedError::ShuttingDown);
        }
        self.shared.injector.push(task);
        self.shared.unpark_one();

        // A shutdown can slip between the state check and the push. A worker
        // that has not yet exited will see the task in its exit check; once
        // every worker has decremented the live count, nothing will, so run
        // the stragglers here. The exiting side drains after its decrement,
        // which makes the two drains cover every interleaving.
        if self.shared.state() != PoolState::Running
            && self.shared.live_workers.load(Ordering::SeqCst) == 0
        {
            self.shared.drain_and_run();
        }
        Ok(())
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for WorkStealingExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<StealShared>, local: WorkerQueue<Task>, parker: Parker, index: usize) {
    debug!("steal worker {}: starting", index);
    let mut idle_rounds = 0u32;

    loop {
        if let Some(task) = find_task(&shared, &local, index) {
            idle_rounds = 0;
            trace!("steal worker {}: executing {}", index, task.id());
            task.run();
            continue;
        }

        if shared.state() != PoolState::Running && no_work_anywhere(&shared, &local) {
            break;
        }

        idle_rounds = idle_rounds.saturating_add(1);
        if idle_rounds <= shared.config.spin_iters {
            std::hint::spin_loop();
        } else {
            parker.park_timeout(shared.config.park_timeout);
        }
    }

    let remaining = shared.live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!("steal worker {}: exiting ({} workers remain)", index, remaining);
    if remaining == 0 {
        // Cover the submit/shutdown race: anything pushed after the other
        // workers decided to exit still gets executed.
        shared.drain_and_run();
        shared.mark_terminated();
    }
}

/// Local pop first (LIFO), then a batch steal from the injector, then a
/// FIFO steal from peers walked round-robin from our own index.
fn find_task(shared: &StealShared, local: &WorkerQueue<Task>, index: usize) -> Option<Task> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }

    let peers = shared.stealers.len();
    for offset in 1..peers {
        let victim = (index + offset) % peers;
        loop {
            match shared.stealers[victim].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }

    None
}

fn no_work_anywhere(shared: &StealShared, local: &WorkerQueue<Task>) -> bool {
    shared.injector.is_empty()
        && local.is_empty()
        && shared.stealers.iter().all(|stealer| stealer.is_empty())
}
