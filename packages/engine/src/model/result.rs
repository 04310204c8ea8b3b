// packages/engine/src/model/result.rs
//! Execution outcomes and per-task resource accounting

use crate::model::ids::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resources consumed by one execution (or accumulated over many)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall-clock seconds the guest ran, an upper bound on its CPU time
    ///
    /// Guests are single-threaded and run on one blocking worker each.
    pub cpu_seconds: f64,

    /// Peak linear memory in MB
    pub memory_peak_mb: f64,

    /// Bytes of output read back from the guest
    pub network_tx_bytes: u64,

    /// Bytes of JSON payload written into the guest
    ///
    /// Sandboxed agents have no sockets; the host boundary is their network.
    pub network_rx_bytes: u64,

    /// Host I/O calls made by the guest (`env.log`)
    ///
    /// Sandboxed agents have no file system, so no disk operations are counted.
    pub disk_io_ops: u64,

    /// GPU utilisation in [0, 1], when the agent reports one
    pub gpu_utilization: Option<f64>,
}

impl ResourceUsage {
    /// Fold one task's usage into a running total
    ///
    /// Counters add up; peaks keep the maximum.
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.cpu_seconds += other.cpu_seconds;
        self.memory_peak_mb = self.memory_peak_mb.max(other.memory_peak_mb);
        self.network_tx_bytes = self.network_tx_bytes.saturating_add(other.network_tx_bytes);
        self.network_rx_bytes = self.network_rx_bytes.saturating_add(other.network_rx_bytes);
        self.disk_io_ops = self.disk_io_ops.saturating_add(other.disk_io_ops);
        self.gpu_utilization = match (self.gpu_utilization, other.gpu_utilization) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn network_bytes(&self) -> u64 {
        self.network_tx_bytes.saturating_add(self.network_rx_bytes)
    }
}

/// Outcome of one task execution
///
/// `error` is present exactly when `success` is false; use the
/// [`ExecutionResult::succeeded`] and [`ExecutionResult::failed`]
/// constructors to keep that true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,

    /// Agent that ran the task, absent when it never reached one
    pub agent_id: Option<AgentId>,

    pub success: bool,
    pub output: serde_json::Value,
    pub execution_time_ms: u64,
    pub resource_usage: ResourceUsage,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,

    /// Metrics reported by the agent through the `metric` host call
    #[serde(default)]
    pub agent_metrics: HashMap<String, f64>,
}

impl ExecutionResult {
    pub fn succeeded(
        task_id: TaskId,
        agent_id: AgentId,
        output: serde_json::Value,
        execution_time_ms: u64,
        resource_usage: ResourceUsage,
    ) -> Self {
        Self {
            task_id,
            agent_id: Some(agent_id),
            success: true,
            output,
            execution_time_ms,
            resource_usage,
            error: None,
            completed_at: Utc::now(),
            agent_metrics: HashMap::new(),
        }
    }

    pub fn failed(task_id: TaskId, agent_id: Option<AgentId>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id,
            success: false,
            output: serde_json::Value::Null,
            execution_time_ms: 0,
            resource_usage: ResourceUsage::default(),
            error: Some(error.into()),
            completed_at: Utc::now(),
            agent_metrics: HashMap::new(),
        }
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = usage;
        self
    }

    pub fn with_agent_metrics(mut self, metrics: HashMap<String, f64>) -> Self {
        self.agent_metrics = metrics;
        self
    }
}
