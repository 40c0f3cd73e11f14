//! Blocking result handles for submitted computations.
//!
//! A [`TaskFuture`] is shared between the submitter and the worker that
//! completes it. The state transition is one-way: a future observed
//! completed, failed, or cancelled never changes again, and exactly one
//! terminal transition happens per submitted computation. Waiters block on
//! a condition variable rather than spinning.

use crate::task::{CancelToken, TaskError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error observed by the caller of [`TaskFuture::get`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FutureError {
    /// The task reached a terminal failure.
    #[error("{0}")]
    Failed(TaskError),

    /// The future was cancelled before the task completed.
    #[error("future cancelled")]
    Cancelled,

    /// The deadline elapsed before the task reached a terminal state.
    /// The task keeps running; only the wait gave up.
    #[error("timed out waiting for result")]
    Timeout,

    /// The result value was already retrieved by an earlier `get`.
    #[error("result already taken")]
    ResultTaken,
}

enum State<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
    Cancelled,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    cancel: CancelToken,
}

/// A handle to a result that is not necessarily available yet.
///
/// Cloning the handle shares the underlying state; the success value itself
/// is handed out once (the first successful `get` moves it out, later calls
/// see [`FutureError::ResultTaken`]). Failures remain observable repeatedly.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TaskFuture<T> {
    /// A pending future wired to the given cancellation token.
    pub(crate) fn pending(cancel: CancelToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                cond: Condvar::new(),
                cancel,
            }),
        }
    }

    /// Terminal transition performed by the completing worker.
    ///
    /// Only a pending future accepts a result; a completion racing a
    /// cancellation that was observed first is discarded.
    pub(crate) fn complete(&self, result: Result<T, TaskError>) {
        let mut state = self.shared.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Ready(result);
            self.shared.cond.notify_all();
        }
    }

    /// Block the calling thread until the result is available.
    pub fn get(&self) -> Result<T, FutureError> {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            self.shared.cond.wait(&mut state);
        }
        Self::take(&mut state)
    }

    /// Block until the result is available or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, FutureError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out()
                && matches!(*state, State::Pending)
            {
                return Err(FutureError::Timeout);
            }
        }
        Self::take(&mut state)
    }

    /// Block until the future reaches a terminal state, without consuming
    /// the result.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Whether the future has reached a terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }

    /// Cancel the future.
    ///
    /// Returns `true` only on the `Pending -> Cancelled` transition. The
    /// task's cancellation token is tripped as well, so a not-yet-started
    /// task will not execute and a running task can observe the signal at
    /// its next yield point.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Cancelled;
            self.shared.cancel.cancel();
            self.shared.cond.notify_all();
            true
        } else {
            false
        }
    }

    fn take(state: &mut State<T>) -> Result<T, FutureError> {
        match std::mem::replace(state, State::Taken) {
            State::Ready(Ok(value)) => Ok(value),
            State::Ready(Err(TaskError::Cancelled)) => {
                *state = State::Cancelled;
                Err(FutureError::Cancelled)
            }
            State::Ready(Err(e)) => {
                // Failures stay observable for every holder of the handle.
                *state = State::Ready(Err(e.clone()));
                Err(FutureError::Failed(e))
            }
            State::Cancelled => {
                *state = State::Cancelled;
                Err(FutureError::Cancelled)
            }
            State::Taken => Err(FutureError::ResultTaken),
            State::Pending => unreachable!("waited past the pending state"),
        }
    }
}
