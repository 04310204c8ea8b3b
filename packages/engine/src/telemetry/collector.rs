// packages/engine/src/telemetry/collector.rs
//! KPI collection
//!
//! Every finished execution passes through [`TelemetryCollector::record`]:
//!
//! ```text
//! ExecutionResult ─► KpiReport ─┬─► ring (ArrayQueue, oldest evicted)
//!                               ├─► stripe[task_id % n] aggregates
//!                               ├─► per-agent gauges (DashMap)
//!                               ├─► broadcast subscribers
//!                               └─► `metrics` facade
//! ```
//!
//! Recording never blocks on the ring; only the one aggregate stripe the
//! task hashes to is locked. Snapshots copy stripes one at a time, so they
//! contend with at most one recorder at once.

use crate::model::{AgentId, ExecutionResult};
use crate::telemetry::kpi::{ExecutionContext, KpiReport};
use crate::telemetry::snapshot::{
    bucket_index, AgentGauge, HistogramBucket, MetricsSnapshot, RingStats, LATENCY_BUCKETS_MS,
};
use crate::utils::config::TelemetryConfig;
use chrono::Utc;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

const BUCKET_COUNT: usize = LATENCY_BUCKETS_MS.len() + 1;

#[derive(Debug, Default, Clone)]
struct Aggregates {
    processed: u64,
    succeeded: u64,
    failed: u64,
    latency_sum_ms: f64,
    accuracy_sum: f64,
    accuracy_count: u64,
    buckets: [u64; BUCKET_COUNT],
}

impl Aggregates {
    fn add(&mut self, report: &KpiReport, success: bool) {
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.latency_sum_ms += report.latency_ms;
        if let Some(accuracy) = report.accuracy {
            self.accuracy_sum += accuracy;
            self.accuracy_count += 1;
        }
        self.buckets[bucket_index(report.latency_ms)] += 1;
    }

    fn merge(&mut self, other: &Aggregates) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.latency_sum_ms += other.latency_sum_ms;
        self.accuracy_sum += other.accuracy_sum;
        self.accuracy_count += other.accuracy_count;
        for (total, count) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *total += count;
        }
    }
}

pub struct TelemetryCollector {
    context: ExecutionContext,

    /// Most recent reports
    ring: ArrayQueue<KpiReport>,
    pushed: AtomicU64,
    evicted: AtomicU64,
    drained: AtomicU64,

    stripes: Vec<Mutex<Aggregates>>,
    agents: DashMap<AgentId, AgentGauge>,
    broadcast: broadcast::Sender<KpiReport>,
    emit_metrics: bool,
}

impl TelemetryCollector {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self::with_context(config, ExecutionContext::host().clone())
    }

    pub fn with_context(config: &TelemetryConfig, context: ExecutionContext) -> Self {
        let (broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            context,
            ring: ArrayQueue::new(config.ring_capacity.max(1)),
            pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            stripes: (0..config.stripes.max(1))
                .map(|_| Mutex::new(Aggregates::default()))
                .collect(),
            agents: DashMap::new(),
            broadcast,
            emit_metrics: config.emit_metrics,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Record against the host context detected at construction
    pub fn record(&self, result: &ExecutionResult) -> Option<KpiReport> {
        self.record_in(result, &self.context)
    }

    /// Record a finished execution
    ///
    /// Returns `None` for results that never reached an agent; those carry
    /// no KPIs.
    pub fn record_in(
        &self,
        result: &ExecutionResult,
        context: &ExecutionContext,
    ) -> Option<KpiReport> {
        let report = KpiReport::from_result(result, context)?;

        let stripe = (u128::from(report.task_id.as_ulid()) % self.stripes.len() as u128) as usize;
        self.stripes[stripe].lock().add(&report, result.success);

        {
            let mut gauge = self.agents.entry(report.agent_id).or_default();
            gauge.cpu_usage = report.cpu_usage;
            gauge.memory_mb = report.memory_mb;
            gauge.tasks += 1;
        }

        if self.ring.force_push(report.clone()).is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);

        if self.emit_metrics {
            emit(&report, result.success);
        }

        // No subscribers is not an error
        let _ = self.broadcast.send(report.clone());

        trace!(
            task_id = %report.task_id,
            agent_id = %report.agent_id,
            latency_ms = report.latency_ms,
            "kpi recorded"
        );
        Some(report)
    }

    /// Point-in-time view of the aggregates
    ///
    /// Each stripe is copied under its own short lock. A report lives in a
    /// single stripe, so a concurrent `record` lands either fully inside or
    /// fully outside the snapshot, and the totals always agree with each
    /// other.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut total = Aggregates::default();
        for stripe in &self.stripes {
            let copy = stripe.lock().clone();
            total.merge(&copy);
        }
        let agents: BTreeMap<AgentId, AgentGauge> = self
            .agents
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let ring = self.ring_stats();

        let mean = |sum: f64, count: u64| (count > 0).then(|| sum / count as f64);

        let latency_histogram = total
            .buckets
            .iter()
            .enumerate()
            .map(|(index, count)| HistogramBucket {
                le_ms: LATENCY_BUCKETS_MS.get(index).copied(),
                count: *count,
            })
            .collect();

        MetricsSnapshot {
            taken_at: Utc::now(),
            processed: total.processed,
            succeeded: total.succeeded,
            failed: total.failed,
            total_latency_ms: total.latency_sum_ms,
            mean_latency_ms: mean(total.latency_sum_ms, total.processed).unwrap_or(0.0),
            mean_accuracy: mean(total.accuracy_sum, total.accuracy_count),
            latency_histogram,
            agents,
            ring,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KpiReport> {
        self.broadcast.subscribe()
    }

    /// Take every report currently in the ring, oldest first
    pub fn drain_reports(&self) -> Vec<KpiReport> {
        let mut reports = Vec::with_capacity(self.ring.len());
        while let Some(report) = self.ring.pop() {
            reports.push(report);
        }
        self.drained.fetch_add(reports.len() as u64, Ordering::Relaxed);
        reports
    }

    pub fn ring_stats(&self) -> RingStats {
        RingStats {
            capacity: self.ring.capacity(),
            len: self.ring.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }

    /// Forget gauges for agents that no longer exist
    pub fn forget_agent(&self, agent: &AgentId) {
        self.agents.remove(agent);
    }
}

fn emit(report: &KpiReport, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("fabric_tasks_processed_total", "outcome" => outcome).increment(1);
    metrics::histogram!("fabric_task_latency_ms").record(report.latency_ms);
    if let Some(accuracy) = report.accuracy {
        metrics::histogram!("fabric_task_accuracy").record(accuracy);
    }
    let agent = report.agent_id.to_string();
    metrics::gauge!("fabric_agent_cpu_usage", "agent" => agent.clone()).set(report.cpu_usage);
    metrics::gauge!("fabric_agent_memory_mb", "agent" => agent).set(report.memory_mb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceUsage, TaskId};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config(ring_capacity: usize) -> TelemetryConfig {
        TelemetryConfig {
            ring_capacity,
            stripes: 4,
            broadcast_capacity: 16,
            emit_metrics: false,
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext {
            hostname: "test".into(),
            available_cores: 2,
            available_memory_mb: 1024,
            gpu_info: None,
            network_interfaces: Vec::new(),
        }
    }

    fn success(agent: AgentId, ms: u64) -> ExecutionResult {
        ExecutionResult::succeeded(
            TaskId::new(),
            agent,
            serde_json::Value::Null,
            ms,
            ResourceUsage {
                cpu_seconds: ms as f64 / 1000.0,
                memory_peak_mb: 3.0,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_record_updates_aggregates() {
        let collector = TelemetryCollector::with_context(&config(8), context());
        let agent = AgentId::new();

        collector.record(&success(agent, 4)).unwrap();
        let mut metrics = HashMap::new();
        metrics.insert("accuracy".to_string(), 0.5);
        collector
            .record(&success(agent, 40).with_agent_metrics(metrics))
            .unwrap();
        collector
            .record(&ExecutionResult::failed(TaskId::new(), Some(agent), "boom").with_execution_time(2))
            .unwrap();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.processed, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total_latency_ms, 46.0);
        assert_eq!(snapshot.mean_accuracy, Some(0.75));
        assert_eq!(snapshot.latency_histogram.len(), 13);
        assert_eq!(snapshot.latency_histogram[1].count, 2);
        assert_eq!(snapshot.latency_histogram[4].count, 1);
        assert_eq!(snapshot.agents[&agent].tasks, 3);
    }

    #[test]
    fn test_unrouted_result_is_not_recorded() {
        let collector = TelemetryCollector::with_context(&config(8), context());
        let report = collector.record(&ExecutionResult::failed(TaskId::new(), None, "no agent"));
        assert!(report.is_none());
        assert_eq!(collector.snapshot().processed, 0);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let collector = TelemetryCollector::with_context(&config(8), context());
        collector.record(&success(AgentId::new(), 12));

        let first = collector.snapshot();
        let second = collector.snapshot();
        assert!(first.same_counters(&second));
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let collector = TelemetryCollector::with_context(&config(2), context());
        let agent = AgentId::new();
        let results: Vec<_> = (1..=3).map(|ms| success(agent, ms)).collect();
        for result in &results {
            collector.record(result);
        }

        let stats = collector.ring_stats();
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.evicted, 1);

        let drained = collector.drain_reports();
        let ids: Vec<_> = drained.iter().map(|report| report.task_id).collect();
        assert_eq!(ids, vec![results[1].task_id, results[2].task_id]);
        assert_eq!(collector.ring_stats().drained, 2);
        assert!(collector.drain_reports().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_reports() {
        let collector = TelemetryCollector::with_context(&config(8), context());
        let mut rx = collector.subscribe();
        let result = success(AgentId::new(), 5);
        collector.record(&result);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.task_id, result.task_id);
        assert_eq!(report.latency_ms, 5.0);
    }

    #[test]
    fn test_snapshots_during_recording_stay_coherent() {
        let collector = Arc::new(TelemetryCollector::with_context(&config(16), context()));
        let recorders: Vec<_> = (0..4)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    let agent = AgentId::new();
                    for ms in 0..250 {
                        if ms % 5 == 0 {
                            collector.record(&ExecutionResult::failed(TaskId::new(), Some(agent), "boom"));
                        } else {
                            collector.record(&success(agent, ms));
                        }
                    }
                })
            })
            .collect();

        let mut last = 0;
        while last < 1000 {
            let snapshot = collector.snapshot();
            assert_eq!(snapshot.processed, snapshot.succeeded + snapshot.failed);
            let bucketed: u64 = snapshot.latency_histogram.iter().map(|b| b.count).sum();
            assert_eq!(bucketed, snapshot.processed);
            assert!(snapshot.processed >= last);
            last = snapshot.processed;
        }
        for recorder in recorders {
            recorder.join().unwrap();
        }
        assert_eq!(collector.snapshot().failed, 200);
    }

    #[test]
    fn test_concurrent_recording() {
        let collector = Arc::new(TelemetryCollector::with_context(&config(64), context()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    let agent = AgentId::new();
                    for ms in 0..50 {
                        collector.record(&success(agent, ms));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.processed, 200);
        assert_eq!(snapshot.agents.len(), 4);
        assert_eq!(snapshot.ring.pushed, 200);
        assert_eq!(snapshot.ring.evicted, 136);
    }
}
