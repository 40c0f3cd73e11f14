//! Managed sets of worker threads.
//!
//! A single generic [`WorkerPool`] covers the fixed, cached, and
//! single-worker disciplines through its configuration: a fixed pool keeps
//! its workers alive until shutdown, a cached pool tears idle workers down
//! after a timeout, and a single-worker pool is a fixed pool of one.

pub mod worker;

pub use worker::{PoolConfig, PoolState, WorkerPool};
