// packages/engine/src/fabric.rs
//! Fabric facade
//!
//! The single entry point composing quota enforcement, the executor, the
//! scheduler and telemetry:
//!
//! ```text
//! Fabric
//! ├─ QuotaEnforcer        (shared ledger)
//! ├─ Executor             (agent arena, sandbox loader)
//! ├─ SchedulerHandle ───► scheduler actor
//! ├─ TelemetryCollector   (KPI ring, aggregates)
//! └─ supervisor task      (heartbeats, health checks, replacement)
//! ```

use crate::model::{AgentId, Capability, ExecutionResult, Task, TaskId, TaskRequest};
use crate::runtime::agent::{AgentInfo, AgentState};
use crate::runtime::executor::Executor;
use crate::runtime::quota::{QuotaEnforcer, ResourceQuota};
use crate::runtime::sandbox::CapabilityManifest;
use crate::scheduler::dispatcher::{SchedulerHandle, SchedulerStats};
use crate::scheduler::results::TaskStatus;
use crate::scheduler::retry::DeadLetterRecord;
use crate::telemetry::{ExportFormat, Exporter, KpiReport, MetricsSnapshot, TelemetryCollector};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, RejectionReason, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Overall condition reported by [`Fabric::get_health`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricStatus {
    Healthy,
    /// Serving, but with unhealthy agents or open circuits
    Degraded,
    /// Work is queued and no agent can take it
    Unhealthy,
    ShuttingDown,
}

impl fmt::Display for FabricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FabricStatus::Healthy => "healthy",
            FabricStatus::Degraded => "degraded",
            FabricStatus::Unhealthy => "unhealthy",
            FabricStatus::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FabricHealth {
    pub status: FabricStatus,
    pub active_agent_count: usize,
    pub queued_task_count: usize,
    pub uptime: Duration,
    pub unhealthy_agent_count: usize,
    pub open_circuits: Vec<Capability>,
}

pub struct Fabric {
    config: EngineConfig,
    quota: Arc<QuotaEnforcer>,
    executor: Arc<Executor>,
    telemetry: Arc<TelemetryCollector>,
    scheduler: SchedulerHandle,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    supervisor: CancellationToken,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
    shutting_down: AtomicBool,
}

impl Fabric {
    /// Build every component and spawn the agents listed in `config.agents`
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let quota = Arc::new(QuotaEnforcer::new(config.quota.clone()));
        let executor = Arc::new(Executor::new(config.executor.clone(), quota.clone())?);
        let telemetry = Arc::new(TelemetryCollector::new(&config.telemetry));
        let (scheduler, scheduler_task) =
            SchedulerHandle::start(config.scheduler.clone(), executor.clone(), telemetry.clone());

        let supervisor = CancellationToken::new();
        let supervisor_task = tokio::spawn(supervise(
            executor.clone(),
            telemetry.clone(),
            scheduler.clone(),
            supervisor.clone(),
        ));

        let fabric = Self {
            config,
            quota,
            executor,
            telemetry,
            scheduler,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            supervisor,
            supervisor_task: Mutex::new(Some(supervisor_task)),
            started: Instant::now(),
            shutting_down: AtomicBool::new(false),
        };

        fabric.spawn_configured_agents().await?;
        info!(
            agents = fabric.executor.active_count(),
            version = crate::VERSION,
            "fabric started"
        );
        Ok(fabric)
    }

    async fn spawn_configured_agents(&self) -> Result<()> {
        for spec in &self.config.agents {
            let binary = tokio::fs::read(&spec.module).await.map_err(|e| {
                EngineError::Config(format!("agent module {}: {}", spec.module.display(), e))
            })?;
            for _ in 0..spec.replicas {
                self.spawn_agent(&binary, Capability::new(spec.capability.as_str()), spec.quota.clone())
                    .await?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn quota(&self) -> &Arc<QuotaEnforcer> {
        &self.quota
    }

    // ---- tasks ----

    pub async fn submit_task(&self, task: Task) -> std::result::Result<TaskId, RejectionReason> {
        self.scheduler.submit(task).await
    }

    /// Submit a task in its wire form
    pub async fn submit_request(&self, request: TaskRequest) -> std::result::Result<TaskId, RejectionReason> {
        let task = Task::try_from(request)?;
        self.submit_task(task).await
    }

    /// Wait for the task's terminal result
    pub async fn get_result(&self, task_id: TaskId) -> Result<ExecutionResult> {
        self.scheduler.results().wait(task_id).await
    }

    pub fn try_get_result(&self, task_id: TaskId) -> Option<ExecutionResult> {
        self.scheduler.results().try_result(task_id)
    }

    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.scheduler.results().status(task_id)
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        self.scheduler.dead_letters().await
    }

    pub async fn scheduler_stats(&self) -> Result<SchedulerStats> {
        self.scheduler.stats().await
    }

    // ---- health & telemetry ----

    pub async fn get_health(&self) -> FabricHealth {
        let active_agent_count = self.executor.active_count();
        let queued_task_count = self.scheduler.queued_count();
        let unhealthy_agent_count = self.executor.count_in(AgentState::Unhealthy);
        let open_circuits = self
            .scheduler
            .stats()
            .await
            .map(|stats| stats.open_circuits)
            .unwrap_or_default();

        let status = if self.shutting_down.load(Ordering::SeqCst) || self.scheduler.is_closed() {
            FabricStatus::ShuttingDown
        } else if queued_task_count > 0 && active_agent_count == 0 {
            FabricStatus::Unhealthy
        } else if unhealthy_agent_count > 0 || !open_circuits.is_empty() {
            FabricStatus::Degraded
        } else {
            FabricStatus::Healthy
        };

        FabricHealth {
            status,
            active_agent_count,
            queued_task_count,
            uptime: self.started.elapsed(),
            unhealthy_agent_count,
            open_circuits,
        }
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.telemetry.snapshot()
    }

    pub fn prometheus_metrics(&self) -> String {
        self.telemetry.snapshot().to_prometheus_text()
    }

    pub fn subscribe_kpis(&self) -> broadcast::Receiver<KpiReport> {
        self.telemetry.subscribe()
    }

    pub fn drain_kpi_reports(&self) -> Vec<KpiReport> {
        self.telemetry.drain_reports()
    }

    /// Drain the report ring and render it with the current snapshot
    pub fn export_kpis(&self, format: ExportFormat) -> Result<String> {
        let snapshot = self.telemetry.snapshot();
        let reports = self.telemetry.drain_reports();
        Exporter::new(format).export(&reports, &snapshot)
    }

    // ---- agents ----

    /// Spawn an agent with the manifest configured for its capability
    pub async fn spawn_agent(
        &self,
        binary: &[u8],
        capability: Capability,
        quota: ResourceQuota,
    ) -> Result<AgentId> {
        let manifest = self
            .config
            .manifest_for(capability.as_str())
            .cloned()
            .ok_or_else(|| EngineError::UnknownCapability(capability.to_string()))?;
        self.spawn_agent_with_manifest(binary, capability, quota, &manifest)
            .await
    }

    pub async fn spawn_agent_with_manifest(
        &self,
        binary: &[u8],
        capability: Capability,
        quota: ResourceQuota,
        manifest: &CapabilityManifest,
    ) -> Result<AgentId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let id = self.executor.spawn(capability, quota, binary, manifest).await?;
        self.scheduler.wake();
        Ok(id)
    }

    pub async fn hot_swap_agent(&self, agent_id: AgentId, binary: &[u8]) -> Result<()> {
        self.executor.hot_swap(agent_id, binary).await?;
        self.scheduler.wake();
        Ok(())
    }

    /// Terminate one agent; the supervisor drops it from the arena on its
    /// next pass
    pub async fn shutdown_agent(&self, agent_id: AgentId) -> Result<()> {
        self.executor.shutdown(agent_id).await?;
        self.telemetry.forget_agent(&agent_id);
        Ok(())
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.executor.agents()
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<AgentInfo> {
        self.executor.agent(agent_id)
    }

    /// Drain queued work, stop every agent and the background tasks
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
        }
        info!("fabric shutting down");

        // Stopped first so terminated agents stay visible after shutdown
        self.supervisor.cancel();
        let supervisor_task = self.supervisor_task.lock().take();
        if let Some(handle) = supervisor_task {
            let _ = handle.await;
        }

        self.scheduler.shutdown().await;
        let scheduler_task = self.scheduler_task.lock().take();
        if let Some(handle) = scheduler_task {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }

        // Agents spawned while the scheduler drained are not known to it
        self.executor.shutdown_all().await;
        info!(uptime_secs = self.started.elapsed().as_secs(), "fabric stopped");
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        self.supervisor.cancel();
    }
}

/// Periodic liveness work: heartbeats, health checks, replacement and
/// pruning of terminated agents
async fn supervise(
    executor: Arc<Executor>,
    telemetry: Arc<TelemetryCollector>,
    scheduler: SchedulerHandle,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(executor.config().supervisor_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let replace = executor.config().replace_unhealthy;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        executor.refresh_idle_heartbeats();
        let unhealthy: Vec<AgentId> = executor
            .health_check_all()
            .into_iter()
            .filter(|health| health.state == AgentState::Unhealthy)
            .map(|health| health.agent_id)
            .collect();

        if replace {
            for agent_id in unhealthy {
                if stop.is_cancelled() {
                    break;
                }
                match executor.replace(agent_id).await {
                    Ok(replacement) => {
                        info!(agent = %agent_id, %replacement, "unhealthy agent replaced")
                    }
                    Err(e) => warn!(agent = %agent_id, error = %e, "agent replacement failed"),
                }
            }
        }

        let pruned = executor.prune_terminated();
        for agent_id in &pruned {
            telemetry.forget_agent(agent_id);
        }
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "terminated agents pruned");
        }

        scheduler.wake();
    }

    debug!("supervisor stopped");
}
