//! Task types, identities, and cooperative cancellation.
//!
//! A [`Task`] is the unit of work that flows through a queue to a worker.
//! It carries its own completion wiring: a fire-and-forget task routes
//! failures to an [`ErrorSink`], a result-producing task fulfils a
//! [`TaskFuture`](crate::future::TaskFuture).

use crate::future::TaskFuture;
use log::error;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a task's own logic during execution.
///
/// Task errors never crash a worker thread; they are captured into the
/// task's future (for submitted computations) or routed to the executor's
/// error sink (for fire-and-forget actions).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task's logic returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task panicked; the panic was recovered at the worker boundary.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before or during execution.
    #[error("task cancelled")]
    Cancelled,
}

/// Identity of a submitted task, unique within its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Sink invoked with the identity and error of a failed fire-and-forget task.
///
/// Failures of `execute`d tasks have no future to land in; they are handed
/// to this sink instead so they are never silently dropped.
pub type ErrorSink = Arc<dyn Fn(TaskId, &TaskError) + Send + Sync>;

/// The default sink: reports failures through the `log` facade.
pub fn logging_sink() -> ErrorSink {
    Arc::new(|id, err| error!("{}: {}", id, err))
}

/// Cooperative cancellation signal handed to every task body.
///
/// A token is either set directly via [`cancel`](CancelToken::cancel) or
/// inherits cancellation from a parent token (a pool-wide shutdown signal
/// cancels every per-task child). Long-running task bodies are expected to
/// check [`is_cancelled`](CancelToken::is_cancelled) at their yield points;
/// nothing is forcibly terminated.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token with no parent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child token. The child is cancelled when either it or this
    /// token is cancelled; cancelling the child leaves this token untouched.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// A queued unit of work.
///
/// The closure inside already carries its completion wiring, so a task can
/// be executed by any worker, or by the caller for tasks handed back from
/// `shutdown_now`.
pub struct Task {
    id: TaskId,
    run: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Get the task's identity.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Execute the task on the calling thread.
    ///
    /// The recovery boundary is baked in: task-logic errors and panics are
    /// captured and routed exactly as they would be on a worker thread.
    pub fn run(self) {
        (self.run)()
    }

    /// A fire-and-forget action. Failures go to `sink`.
    pub(crate) fn action<F>(id: TaskId, token: CancelToken, sink: ErrorSink, f: F) -> Self
    where
        F: FnOnce(&CancelToken) -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            id,
            run: Box::new(move || {
                if token.is_cancelled() {
                    return;
                }
                if let Err(e) = run_guarded(f, &token) {
                    sink(id, &e);
                }
            }),
        }
    }

    /// A result-producing computation. The outcome lands in `future`.
    pub(crate) fn computation<T, F>(
        id: TaskId,
        token: CancelToken,
        future: &TaskFuture<T>,
        f: F,
    ) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        let future = future.clone();
        Self {
            id,
            run: Box::new(move || {
                if token.is_cancelled() {
                    future.complete(Err(TaskError::Cancelled));
                    return;
                }
                future.complete(run_guarded(f, &token));
            }),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

/// Run a task body with panic recovery.
pub(crate) fn run_guarded<T, F>(f: F, token: &CancelToken) -> Result<T, TaskError>
where
    F: FnOnce(&CancelToken) -> Result<T, TaskError>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(token))) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_child_token_inherits_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(parent.is_cancelled());
    }

    #[test]
    fn test_child_cancellation_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_action_routes_failure_to_sink() {
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();
        let sink: ErrorSink = Arc::new(move |_, _| {
            failures_clone.fetch_add(1, Ordering::SeqCst);
        });

        let task = Task::action(TaskId(1), CancelToken::new(), sink.clone(), |_| {
            Err(TaskError::Failed("nope".into()))
        });
        task.run();
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // A panicking body is recovered and reported the same way.
        let task = Task::action(TaskId(2), CancelToken::new(), sink, |_| {
            panic!("boom");
        });
        task.run();
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancelled_action_does_not_execute() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let token = CancelToken::new();
        token.cancel();

        let task = Task::action(TaskId(3), token, logging_sink(), move |_| {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        task.run();
        assert!(!ran.load(Ordering::SeqCst));
    }
}
