// packages/engine/src/model/mod.rs
//! Core data model: tasks, identifiers and execution outcomes

pub mod ids;
pub mod result;
pub mod task;

pub use ids::{AgentId, Capability, TaskId};
pub use result::{ExecutionResult, ResourceUsage};
pub use task::{Priority, PriorityValue, Task, TaskBuilder, TaskRequest};
