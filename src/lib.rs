#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Taskpool
//!
//! Worker-pool task execution with blocking result futures.
//!
//! This crate provides a small family of executors over a shared task and
//! future model:
//!
//! - [`Executor`]: a queue-fed worker pool in fixed, cached, and
//!   single-worker flavors
//! - [`ScheduledExecutor`]: delayed and periodic execution with fixed-rate
//!   and fixed-delay timing
//! - [`WorkStealingExecutor`]: per-worker deques with idle-time stealing
//!   and batch submission
//!
//! Tasks are plain closures handed a [`CancelToken`]. Result-producing
//! submissions return a [`TaskFuture`] that blocks on retrieval; failures of
//! fire-and-forget tasks are routed to an injectable error sink. Every
//! executor supports graceful shutdown, immediate shutdown with recovery of
//! unexecuted tasks, and bounded termination waits.

/// Executor front-ends: direct, scheduled, and work-stealing
pub mod executor;

/// Blocking result futures for submitted computations
pub mod future;

/// Worker-pool lifecycle, sizing, and termination
pub mod pool;

/// Bounded and unbounded task queues with rejection on overflow
pub mod queue;

/// Task representation, identity, cancellation, and error routing
pub mod task;

// Re-export key types for easier access
pub use executor::{
    Executor, ExecutorConfig, ScheduleHandle, ScheduledConfig, ScheduledExecutor, StealConfig,
    WorkStealingExecutor,
};
pub use future::{FutureError, TaskFuture};
pub use pool::{PoolConfig, PoolState, WorkerPool};
pub use queue::RejectedError;
pub use task::{logging_sink, CancelToken, ErrorSink, Task, TaskError, TaskId};
