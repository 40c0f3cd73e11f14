//! Timer-driven resubmission: delayed, fixed-rate, and fixed-delay tasks.
//!
//! A dedicated timer thread owns a min-heap of schedule entries ordered by
//! due time (ties break by submission order) and hands due firings to a
//! worker pool. An entry is only re-armed after its firing completes, so
//! two firings of the same entry never overlap. With a single-worker
//! configuration, firings of *all* entries are serialized, earliest-due
//! first.

use crate::executor::core::{Executor, ExecutorConfig};
use crate::future::TaskFuture;
use crate::queue::RejectedError;
use crate::task::{run_guarded, CancelToken, TaskError, TaskId};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a [`ScheduledExecutor`].
#[derive(Debug, Clone)]
pub struct ScheduledConfig {
    /// Number of workers available for firings.
    pub worker_count: usize,

    /// Name prefix for the worker and timer threads.
    pub thread_name_prefix: String,
}

impl ScheduledConfig {
    /// A scheduler whose firings are all serialized on one worker.
    pub fn single_worker() -> Self {
        Self {
            worker_count: 1,
            ..Default::default()
        }
    }
}

impl Default for ScheduledConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            thread_name_prefix: "taskpool-sched".to_string(),
        }
    }
}

/// Handle to a recurring schedule entry.
///
/// Cancelling prevents future firings; an in-flight firing finishes.
#[derive(Clone)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    /// Cancel the entry. Returns `true` the first time, `false` afterwards.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Whether the entry has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum Timing {
    /// Fire once, never re-arm.
    Once,
    /// Due times follow the `first + k * period` series regardless of how
    /// long each firing took; after an overrun the next slot is already
    /// past, so the catch-up firing happens immediately on completion and
    /// the series itself does not shift.
    FixedRate { period: Duration },
    /// Next due time is measured from each firing's completion, so
    /// overruns push every subsequent firing back.
    FixedDelay { delay: Duration },
}

type ScheduledFn = Arc<dyn Fn(&CancelToken) -> Result<(), TaskError> + Send + Sync>;

/// Runs its payload when dropped without being completed first. One-shot
/// entries use this to resolve their future as cancelled if the entry is
/// discarded before it ever fires (scheduler shutdown, pool rejection).
struct DiscardGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for DiscardGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

struct Entry {
    seq: u64,
    due: Instant,
    timing: Timing,
    task: ScheduledFn,
    cancelled: Arc<AtomicBool>,
    guard: Option<DiscardGuard>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest due time, then the
    // earliest submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<Entry>>,
    cond: Condvar,
    running: AtomicBool,
}

/// An executor extended with timer-driven resubmission.
pub struct ScheduledExecutor {
    executor: Arc<Executor>,
    shared: Arc<TimerShared>,
    next_seq: AtomicU64,
}

impl ScheduledExecutor {
    /// Create a scheduled executor and start its timer thread.
    pub fn with_config(config: ScheduledConfig) -> Self {
        info!(
            "creating scheduled executor with {} workers",
            config.worker_count
        );

        let executor = Arc::new(Executor::with_config(ExecutorConfig {
            worker_count: config.worker_count,
            thread_name_prefix: config.thread_name_prefix.clone(),
            ..Default::default()
        }));
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        });

        {
            let shared = Arc::clone(&shared);
            let executor = Arc::clone(&executor);
            thread::Builder::new()
                .name(format!("{}-timer", config.thread_name_prefix))
                .spawn(move || timer_loop(shared, executor))
                .expect("failed to spawn timer thread");
        }

        Self {
            executor,
            shared,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Submit a fire-and-forget action for immediate execution, bypassing
    /// the timer.
    pub fn execute<F>(&self, f: F) -> Result<TaskId, RejectedError>
    where
        F: FnOnce(&CancelToken) -> Result<(), TaskError> + Send + 'static,
    {
        self.executor.execute(f)
    }

    /// Submit a result-producing computation for immediate execution,
    /// bypassing the timer.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        self.executor.submit(f)
    }

    /// Run `f` once after `delay`, returning a future for its result.
    pub fn schedule_once<T, F>(
        &self,
        f: F,
        delay: Duration,
    ) -> Result<TaskFuture<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        let token = self.executor.cancel_token().child();
        let future = TaskFuture::pending(token.clone());

        let slot = Mutex::new(Some(f));
        let run_future = future.clone();
        let task: ScheduledFn = Arc::new(move |_fire_token| {
            if let Some(f) = slot.lock().take() {
                if token.is_cancelled() {
                    run_future.complete(Err(TaskError::Cancelled));
                } else {
                    run_future.complete(run_guarded(f, &token));
                }
            }
            Ok(())
        });

        let guard_future = future.clone();
        let guard = DiscardGuard(Some(Box::new(move || {
            guard_future.complete(Err(TaskError::Cancelled));
        })));

        self.push_entry(task, delay, Timing::Once, Arc::new(AtomicBool::new(false)), Some(guard))?;
        Ok(future)
    }

    /// Run `f` repeatedly on the `initial_delay + k * period` series.
    ///
    /// Firing duration does not shift the series; an execution that
    /// overruns the period is followed by an immediate catch-up firing.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduleHandle, RejectedError>
    where
        F: Fn(&CancelToken) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.schedule_recurring(f, initial_delay, Timing::FixedRate { period })
    }

    /// Run `f` repeatedly, waiting `delay` after each completion before the
    /// next firing.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduleHandle, RejectedError>
    where
        F: Fn(&CancelToken) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.schedule_recurring(f, initial_delay, Timing::FixedDelay { delay })
    }

    /// Stop the timer and the pool. Pending (not yet due) entries are
    /// discarded; queued and in-flight firings run to completion.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("shutting down scheduled executor");
        }
        let discarded = {
            let mut heap = self.shared.heap.lock();
            let n = heap.len();
            heap.clear();
            n
        };
        self.shared.cond.notify_all();
        if discarded > 0 {
            debug!("discarded {} pending schedule entries", discarded);
        }
        self.executor.shutdown();
    }

    /// Like [`shutdown`](Self::shutdown), but additionally signals
    /// cancellation to in-flight firings and returns queued-but-unstarted
    /// firings.
    pub fn shutdown_now(&self) -> Vec<crate::task::Task> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.heap.lock().clear();
        self.shared.cond.notify_all();
        self.executor.shutdown_now()
    }

    /// Block until the pool terminates or `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.executor.await_termination(timeout)
    }

    /// Whether the scheduler has stopped accepting entries.
    pub fn is_shutdown(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst)
    }

    fn schedule_recurring<F>(
        &self,
        f: F,
        initial_delay: Duration,
        timing: Timing,
    ) -> Result<ScheduleHandle, RejectedError>
    where
        F: Fn(&CancelToken) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.push_entry(Arc::new(f), initial_delay, timing, cancelled.clone(), None)?;
        Ok(ScheduleHandle { cancelled })
    }

    fn push_entry(
        &self,
        task: ScheduledFn,
        initial_delay: Duration,
        timing: Timing,
        cancelled: Arc<AtomicBool>,
        guard: Option<DiscardGuard>,
    ) -> Result<(), RejectedError> {
        let entry = Entry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            due: Instant::now() + initial_delay,
            timing,
            task,
            cancelled,
            guard,
        };

        let mut heap = self.shared.heap.lock();
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(RejectedError::ShuttingDown);
        }
        heap.push(entry);
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl Drop for ScheduledExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>, executor: Arc<Executor>) {
    debug!("timer: starting");

    loop {
        let mut heap = shared.heap.lock();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let entry = match heap.peek() {
            None => {
                shared.cond.wait(&mut heap);
                continue;
            }
            Some(e) if e.due > now => {
                let due = e.due;
                shared.cond.wait_until(&mut heap, due);
                continue;
            }
            Some(_) => heap.pop().expect("peeked entry vanished"),
        };
        drop(heap);

        if entry.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        fire(&shared, &executor, entry);
    }

    debug!("timer: exiting");
}

/// Hand a due entry to the pool. Re-arming happens inside the firing, after
/// the task body completes, which gives single-entry mutual exclusion.
fn fire(shared: &Arc<TimerShared>, executor: &Arc<Executor>, entry: Entry) {
    let shared = Arc::clone(shared);
    let scheduled_for = entry.due;

    let submitted = executor.execute(move |token| {
        let mut entry = entry;
        let result = (entry.task)(token);

        let next_due = match entry.timing {
            Timing::Once => None,
            Timing::FixedRate { period } => Some(scheduled_for + period),
            Timing::FixedDelay { delay } => Some(Instant::now() + delay),
        };
        if let Some(due) = next_due {
            if !entry.cancelled.load(Ordering::SeqCst) {
                entry.due = due;
                let mut heap = shared.heap.lock();
                if shared.running.load(Ordering::SeqCst) {
                    heap.push(entry);
                    shared.cond.notify_all();
                }
            }
        }
        result
    });

    if let Err(e) = submitted {
        // The pool stopped underneath the timer; the entry was dropped with
        // the rejected task and any one-shot future resolved as cancelled.
        debug!("dropping due firing: {}", e);
    }
}
