// packages/engine/src/telemetry/kpi.rs
//! KPI reports derived from execution results

use crate::model::{AgentId, ExecutionResult, TaskId};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metric an agent reports to set its own accuracy
pub const ACCURACY_METRIC: &str = "accuracy";

/// GPU present on the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub memory_mb: u32,
    pub compute_capability: Option<String>,
    pub driver_version: String,
}

/// Host the fabric runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub hostname: String,
    pub available_cores: usize,
    pub available_memory_mb: u64,
    pub gpu_info: Option<GpuInfo>,
    pub network_interfaces: Vec<String>,
}

static HOST_CONTEXT: Lazy<ExecutionContext> = Lazy::new(ExecutionContext::detect);

impl ExecutionContext {
    /// The local host, probed once per process
    pub fn host() -> &'static ExecutionContext {
        &HOST_CONTEXT
    }

    /// Probe the local host
    pub fn detect() -> Self {
        Self {
            hostname: detect_hostname(),
            available_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            available_memory_mb: detect_memory_mb().unwrap_or(0),
            gpu_info: None,
            network_interfaces: detect_interfaces(),
        }
    }
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn detect_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

fn detect_interfaces() -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Immutable performance record for one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub latency_ms: f64,

    /// Present exactly when the execution succeeded
    pub accuracy: Option<f64>,

    /// Fraction of the host's cores used, in [0, 1]
    pub cpu_usage: f64,

    pub memory_mb: f64,
    pub network_bytes: u64,
    pub custom_metrics: HashMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
    pub context: ExecutionContext,
}

impl KpiReport {
    /// Derive a report; `None` when the result never reached an agent
    pub fn from_result(result: &ExecutionResult, context: &ExecutionContext) -> Option<Self> {
        let agent_id = result.agent_id?;

        let accuracy = result.success.then(|| {
            result
                .agent_metrics
                .get(ACCURACY_METRIC)
                .copied()
                .filter(|value| value.is_finite())
                .map(|value| value.clamp(0.0, 1.0))
                .unwrap_or(1.0)
        });

        let wall_secs = result.execution_time_ms as f64 / 1000.0;
        let cpu_usage = if wall_secs > 0.0 {
            let cores = context.available_cores.max(1) as f64;
            (result.resource_usage.cpu_seconds / wall_secs / cores).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Some(Self {
            task_id: result.task_id,
            agent_id,
            latency_ms: result.execution_time_ms as f64,
            accuracy,
            cpu_usage,
            memory_mb: result.resource_usage.memory_peak_mb,
            network_bytes: result.resource_usage.network_bytes(),
            custom_metrics: result.agent_metrics.clone(),
            recorded_at: Utc::now(),
            context: context.clone(),
        })
    }
}
