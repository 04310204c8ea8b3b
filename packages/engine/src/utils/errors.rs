// packages/engine/src/utils/errors.rs
//! Error types for the execution fabric
//!
//! Errors fall into four families:
//!
//! - **Admission**: quota and capability mismatches, rejected synchronously
//! - **Execution**: failures inside a dispatched agent, retried by the scheduler
//! - **Agent faults**: crashes, deadline expiry, missed heartbeats
//! - **Systemic**: queue exhaustion, sandbox loader failures, configuration

use crate::model::{AgentId, TaskId};
use crate::runtime::agent::AgentState;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("task rejected: {0}")]
    Rejected(#[from] RejectionReason),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("agent {agent} cannot go from {from} to {to}")]
    InvalidTransition {
        agent: AgentId,
        from: AgentState,
        to: AgentState,
    },

    #[error("agent {agent} is {state}, expected {expected}")]
    AgentNotReady {
        agent: AgentId,
        state: AgentState,
        expected: AgentState,
    },

    #[error("agent {agent} serves '{serves}', task requires '{required}'")]
    CapabilityMismatch {
        agent: AgentId,
        serves: String,
        required: String,
    },

    #[error("no capability manifest configured for '{0}'")]
    UnknownCapability(String),

    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("observability setup failed: {0}")]
    Observability(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fabric is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Reasons a task is refused at submission time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("queue full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("invalid priority '{0}'")]
    InvalidPriority(String),

    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("invalid deadline: {0}")]
    InvalidDeadline(String),

    #[error("fabric is shutting down")]
    ShuttingDown,
}

/// Sandbox loading failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("module imports {module}.{name}, which the manifest does not declare")]
    CapabilityViolation { module: String, name: String },

    #[error("module does not export '{0}' with the expected signature")]
    MissingExport(String),

    #[error("sandbox engine unavailable: {0}")]
    Engine(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;
