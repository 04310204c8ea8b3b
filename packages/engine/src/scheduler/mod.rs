// packages/engine/src/scheduler/mod.rs
//! Priority scheduling
//!
//! - `queue`: one logical queue, (priority desc, sequence asc)
//! - `retry`: exponential backoff and the bounded dead-letter log
//! - `circuit_breaker`: per-capability failure isolation
//! - `results`: task status store for polling and awaiting
//! - `dispatcher`: the actor tying them to the executor

pub mod circuit_breaker;
pub mod dispatcher;
pub mod queue;
pub mod results;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitStatus};
pub use dispatcher::{SchedulerHandle, SchedulerStats};
pub use queue::TaskQueue;
pub use results::{ResultStore, TaskStatus};
pub use retry::{DeadLetterReason, DeadLetterRecord, FailureRecord, RetryPolicy};
