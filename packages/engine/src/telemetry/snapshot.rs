// packages/engine/src/telemetry/snapshot.rs
//! Point-in-time view of the running aggregates

use crate::model::AgentId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Upper bounds of the latency histogram buckets, in milliseconds
pub const LATENCY_BUCKETS_MS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Index of the bucket a latency falls in; the last index is overflow
pub fn bucket_index(latency_ms: f64) -> usize {
    LATENCY_BUCKETS_MS
        .iter()
        .position(|bound| latency_ms <= *bound)
        .unwrap_or(LATENCY_BUCKETS_MS.len())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// Upper bound in ms, `None` for the overflow bucket
    pub le_ms: Option<f64>,
    pub count: u64,
}

/// Latest resource readings for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentGauge {
    pub cpu_usage: f64,
    pub memory_mb: f64,
    pub tasks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RingStats {
    pub capacity: usize,
    pub len: usize,
    pub pushed: u64,
    pub evicted: u64,
    pub drained: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_latency_ms: f64,
    pub mean_latency_ms: f64,
    pub mean_accuracy: Option<f64>,
    pub latency_histogram: Vec<HistogramBucket>,
    pub agents: BTreeMap<AgentId, AgentGauge>,
    pub ring: RingStats,
}

impl MetricsSnapshot {
    /// Equal in everything but the time it was taken
    pub fn same_counters(&self, other: &MetricsSnapshot) -> bool {
        self.processed == other.processed
            && self.succeeded == other.succeeded
            && self.failed == other.failed
            && self.total_latency_ms == other.total_latency_ms
            && self.mean_accuracy == other.mean_accuracy
            && self.latency_histogram == other.latency_histogram
            && self.agents == other.agents
            && self.ring == other.ring
    }

    /// Prometheus text exposition format
    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("fabric_tasks_processed_total", "Executions recorded", self.processed),
            ("fabric_tasks_succeeded_total", "Successful executions", self.succeeded),
            ("fabric_tasks_failed_total", "Failed executions", self.failed),
            ("fabric_kpi_reports_evicted_total", "KPI reports evicted from the ring", self.ring.evicted),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let _ = writeln!(out, "# HELP fabric_task_latency_ms Execution latency in milliseconds");
        let _ = writeln!(out, "# TYPE fabric_task_latency_ms histogram");
        let mut cumulative = 0;
        for bucket in &self.latency_histogram {
            cumulative += bucket.count;
            let le = bucket
                .le_ms
                .map(|bound| bound.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            let _ = writeln!(out, "fabric_task_latency_ms_bucket{{le=\"{}\"}} {}", le, cumulative);
        }
        let _ = writeln!(out, "fabric_task_latency_ms_sum {}", self.total_latency_ms);
        let _ = writeln!(out, "fabric_task_latency_ms_count {}", self.processed);

        if let Some(accuracy) = self.mean_accuracy {
            let _ = writeln!(out, "# HELP fabric_task_accuracy_mean Mean accuracy of successful executions");
            let _ = writeln!(out, "# TYPE fabric_task_accuracy_mean gauge");
            let _ = writeln!(out, "fabric_task_accuracy_mean {}", accuracy);
        }

        if !self.agents.is_empty() {
            let _ = writeln!(out, "# HELP fabric_agent_cpu_usage Last CPU fraction per agent");
            let _ = writeln!(out, "# TYPE fabric_agent_cpu_usage gauge");
            for (agent, gauge) in &self.agents {
                let _ = writeln!(out, "fabric_agent_cpu_usage{{agent=\"{}\"}} {}", agent, gauge.cpu_usage);
            }
            let _ = writeln!(out, "# HELP fabric_agent_memory_mb Last peak memory per agent");
            let _ = writeln!(out, "# TYPE fabric_agent_memory_mb gauge");
            for (agent, gauge) in &self.agents {
                let _ = writeln!(out, "fabric_agent_memory_mb{{agent=\"{}\"}} {}", agent, gauge.memory_mb);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0.5), 0);
        assert_eq!(bucket_index(1.0), 0);
        assert_eq!(bucket_index(7.0), 2);
        assert_eq!(bucket_index(10_000.0), 11);
        assert_eq!(bucket_index(60_000.0), 12);
    }

    #[test]
    fn test_prometheus_histogram_is_cumulative() {
        let mut histogram: Vec<HistogramBucket> = LATENCY_BUCKETS_MS
            .iter()
            .map(|bound| HistogramBucket {
                le_ms: Some(*bound),
                count: 0,
            })
            .collect();
        histogram.push(HistogramBucket { le_ms: None, count: 0 });
        histogram[0].count = 2;
        histogram[3].count = 1;

        let snapshot = MetricsSnapshot {
            taken_at: Utc::now(),
            processed: 3,
            succeeded: 3,
            failed: 0,
            total_latency_ms: 21.0,
            mean_latency_ms: 7.0,
            mean_accuracy: Some(1.0),
            latency_histogram: histogram,
            agents: BTreeMap::new(),
            ring: RingStats::default(),
        };

        let text = snapshot.to_prometheus_text();
        assert!(text.contains("fabric_tasks_processed_total 3"));
        assert!(text.contains("fabric_task_latency_ms_bucket{le=\"1\"} 2"));
        assert!(text.contains("fabric_task_latency_ms_bucket{le=\"25\"} 3"));
        assert!(text.contains("fabric_task_latency_ms_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("fabric_task_latency_ms_count 3"));
    }
}
