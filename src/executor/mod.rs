//! Task submission façades over the worker pools.
//!
//! [`Executor`] is the base fire-and-forget / future-returning surface,
//! [`ScheduledExecutor`] adds timer-driven resubmission, and
//! [`WorkStealingExecutor`] trades the shared queue for per-worker stealing
//! deques.

pub mod core;
pub mod scheduled;
pub mod stealing;

pub use self::core::{Executor, ExecutorConfig};
pub use scheduled::{ScheduleHandle, ScheduledConfig, ScheduledExecutor};
pub use stealing::{StealConfig, WorkStealingExecutor};
