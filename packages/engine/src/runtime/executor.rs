// packages/engine/src/runtime/executor.rs
//! Agent lifecycle manager
//!
//! Owns every live agent in an id-indexed arena and is the only component
//! that mutates agent records. Other components refer to agents by
//! [`AgentId`] and ask the executor to act on them.
//!
//! # Execution
//!
//! ```text
//! run(agent, task)
//!   ├─ Ready → Executing               (agent lock, released before await)
//!   ├─ sandbox invoke on blocking pool  (deadline + cancel at epoch ticks)
//!   ├─ select: finished | hard stop | cancel + grace
//!   └─ Executing → Ready | Unhealthy    (agent lock)
//! ```
//!
//! Deadline expiry, traps and guests that ignore cancellation poison the
//! agent. A negative guest status, a cooperative cancel or task limits the
//! module cannot run under do not.

use crate::model::{AgentId, Capability, ExecutionResult, Task, TaskId};
use crate::runtime::agent::{Agent, AgentHealth, AgentInfo, AgentState, LifecycleEvent};
use crate::runtime::host::{HostImport, StopReason};
use crate::runtime::quota::{Admission, QuotaEnforcer, ResourceQuota};
use crate::runtime::sandbox::{
    CapabilityManifest, Invocation, InvocationLimits, InvocationOutcome, SandboxHandle, SandboxLoader,
};
use crate::utils::config::ExecutorConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BYTES_PER_MB: usize = 1024 * 1024;

/// Why a task stopped before the agent finished it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Hard deadline reached
    Deadline,
    /// Guest trapped
    Crashed,
    /// Guest stopped cooperatively after a cancel
    Cancelled,
    /// Guest ignored cancellation and was abandoned
    Forced,
}

impl Interruption {
    /// Whether the agent is unfit for further work afterwards
    pub fn poisons_agent(&self) -> bool {
        !matches!(self, Interruption::Cancelled)
    }
}

/// A finished dispatch: the task handed back with its outcome
#[derive(Debug)]
pub struct Execution {
    pub task: Task,
    pub result: ExecutionResult,
    pub interruption: Option<Interruption>,
}

/// A dispatch refused before anything ran
#[derive(Debug)]
pub struct DispatchError {
    pub task: Task,
    pub error: EngineError,
}

struct AgentSlot {
    agent: Mutex<Agent>,
    /// Signalled whenever the agent leaves `Executing`
    idle: Notify,
}

enum Joined {
    Finished(Invocation),
    Panicked(String),
    Abandoned,
}

/// Agent arena and lifecycle operations
pub struct Executor {
    config: ExecutorConfig,
    loader: Arc<SandboxLoader>,
    quota: Arc<QuotaEnforcer>,
    agents: RwLock<HashMap<AgentId, Arc<AgentSlot>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, quota: Arc<QuotaEnforcer>) -> Result<Self> {
        let loader = SandboxLoader::new(config.sandbox.clone())?;
        info!(
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            missed_heartbeat_threshold = config.missed_heartbeat_threshold,
            "executor initialized"
        );

        Ok(Self {
            config,
            loader: Arc::new(loader),
            quota,
            agents: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn quota(&self) -> &Arc<QuotaEnforcer> {
        &self.quota
    }

    fn slot(&self, id: AgentId) -> Result<Arc<AgentSlot>> {
        self.agents
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::AgentNotFound(id))
    }

    async fn load(&self, binary: Arc<[u8]>, manifest: CapabilityManifest) -> Result<SandboxHandle> {
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || loader.load(&binary, &manifest))
            .await
            .map_err(|e| EngineError::Internal(format!("sandbox loader panicked: {}", e)))?
            .map_err(EngineError::from)
    }

    /// Admit, load and initialize a new agent
    ///
    /// Nothing is recorded when admission or loading fails.
    pub async fn spawn(
        &self,
        capability: Capability,
        quota: ResourceQuota,
        binary: &[u8],
        manifest: &CapabilityManifest,
    ) -> Result<AgentId> {
        if let Admission::Rejected(reason) = self.quota.admit_configured(&quota) {
            warn!(capability = %capability, reason = %reason, "agent quota rejected");
            return Err(EngineError::QuotaExceeded(reason));
        }
        if !self.quota.reserve_agent_slot() {
            return Err(EngineError::QuotaExceeded(format!(
                "agent limit of {} reached",
                self.quota.max_agents()
            )));
        }

        let binary: Arc<[u8]> = Arc::from(binary);
        let sandbox = match self.load(binary.clone(), manifest.clone()).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.quota.release_agent_slot();
                warn!(capability = %capability, error = %e, "agent load failed");
                return Err(e);
            }
        };

        let mut agent = Agent::new(capability.clone(), quota, sandbox, binary);
        agent.transition(LifecycleEvent::BeginInit)?;
        agent.transition(LifecycleEvent::Initialized)?;
        agent.touch();

        let id = agent.id();
        info!(agent = %id, capability = %capability, digest = %agent.sandbox.digest(), "agent ready");

        self.agents.write().insert(
            id,
            Arc::new(AgentSlot {
                agent: Mutex::new(agent),
                idle: Notify::new(),
            }),
        );

        metrics::counter!("fabric_agents_spawned_total").increment(1);
        self.publish_gauges();
        Ok(id)
    }

    /// Run `task` on a Ready agent and return only the result
    pub async fn execute(&self, agent_id: AgentId, task: Task) -> Result<ExecutionResult> {
        self.run(agent_id, task)
            .await
            .map(|execution| execution.result)
            .map_err(|refused| refused.error)
    }

    /// Run `task` on a Ready agent, handing the task back with its outcome
    pub async fn run(&self, agent_id: AgentId, task: Task) -> std::result::Result<Execution, DispatchError> {
        let slot = match self.slot(agent_id) {
            Ok(slot) => slot,
            Err(error) => return Err(DispatchError { task, error }),
        };

        let (handle, limits, hard_deadline) = {
            let mut agent = slot.agent.lock();

            if agent.state != AgentState::Ready || agent.drain_requested {
                let error = EngineError::AgentNotReady {
                    agent: agent_id,
                    state: agent.state,
                    expected: AgentState::Ready,
                };
                return Err(DispatchError { task, error });
            }
            if agent.capability != *task.capability() {
                let error = EngineError::CapabilityMismatch {
                    agent: agent_id,
                    serves: agent.capability.to_string(),
                    required: task.capability().to_string(),
                };
                return Err(DispatchError { task, error });
            }

            let mut budget = agent
                .quota
                .max_execution_time()
                .min(task.resource_quota().max_execution_time());
            if let Some(remaining) = task.time_remaining(Utc::now()) {
                if remaining.is_zero() {
                    drop(agent);
                    debug!(task = %task.id(), agent = %agent_id, "deadline passed before dispatch");
                    let result = ExecutionResult::failed(task.id(), Some(agent_id), "deadline passed before dispatch");
                    return Ok(Execution {
                        task,
                        result,
                        interruption: None,
                    });
                }
                budget = budget.min(remaining);
            }

            if let Err(error) = agent.transition(LifecycleEvent::Dispatched) {
                return Err(DispatchError { task, error });
            }

            let token = CancellationToken::new();
            agent.cancel = Some(token.clone());
            agent.current_task = Some(task.id());
            agent.touch();

            let memory_mb = agent.quota.memory_mb.min(task.resource_quota().memory_mb);
            let deadline = Instant::now() + budget;
            let limits = InvocationLimits {
                agent: agent_id,
                deadline,
                memory_bytes: (memory_mb as usize).saturating_mul(BYTES_PER_MB),
                cancel: token,
                heartbeat: agent.heartbeat.clone(),
            };
            (agent.sandbox.clone(), limits, (deadline, budget))
        };

        debug!(task = %task.id(), agent = %agent_id, budget_ms = hard_deadline.1.as_millis() as u64, "dispatching");

        let started = Instant::now();
        let token = limits.cancel.clone();
        let joined = self.invoke(handle, task.payload().clone(), limits, hard_deadline.0).await;
        if matches!(joined, Joined::Abandoned) {
            token.cancel();
        }

        let (mut result, interruption) = outcome_to_result(&task, agent_id, joined, started, hard_deadline.1);
        self.finish(&slot, &mut result, interruption);

        Ok(Execution {
            task,
            result,
            interruption,
        })
    }

    async fn invoke(
        &self,
        handle: SandboxHandle,
        payload: serde_json::Value,
        limits: InvocationLimits,
        deadline: Instant,
    ) -> Joined {
        let grace = self.config.cancel_grace();
        let token = limits.cancel.clone();
        let hard_stop = tokio::time::Instant::from_std(deadline) + grace;

        let mut join = tokio::task::spawn_blocking(move || handle.invoke(&payload, limits));

        tokio::select! {
            joined = &mut join => match joined {
                Ok(invocation) => Joined::Finished(invocation),
                Err(e) => Joined::Panicked(e.to_string()),
            },
            _ = tokio::time::sleep_until(hard_stop) => Joined::Abandoned,
            _ = async {
                token.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Joined::Abandoned,
        }
    }

    /// Fold an outcome back into the agent record
    fn finish(&self, slot: &AgentSlot, result: &mut ExecutionResult, interruption: Option<Interruption>) {
        let mut agent = slot.agent.lock();
        let id = agent.id;

        agent.usage.accumulate(&result.resource_usage);
        agent
            .stats
            .record(result.success, result.execution_time_ms, result.completed_at);
        agent.current_task = None;
        agent.cancel = None;

        if agent.state == AgentState::Executing {
            let poisoned = interruption.map(|i| i.poisons_agent()).unwrap_or(false);
            let event = if poisoned {
                LifecycleEvent::Faulted
            } else {
                LifecycleEvent::Finished
            };
            if let Err(e) = agent.transition(event) {
                error!(agent = %id, error = %e, "agent left in unexpected state");
            }
            if poisoned {
                agent.fault = result.error.clone();
                warn!(agent = %id, fault = ?agent.fault, "agent marked unhealthy");
                metrics::counter!("fabric_agent_faults_total").increment(1);
            } else {
                agent.touch();
            }
        }

        drop(agent);
        slot.idle.notify_waiters();
        self.publish_gauges();
    }

    /// Non-blocking liveness check
    ///
    /// Ready agents, and Executing agents whose manifest grants `heartbeat`,
    /// that have been silent for `missed_heartbeat_threshold` intervals are
    /// moved to Unhealthy and any in-flight task is cancelled.
    pub fn health_check(&self, agent_id: AgentId) -> Result<AgentHealth> {
        let slot = self.slot(agent_id)?;
        let mut agent = slot.agent.lock();

        let missed = agent.missed_intervals(Utc::now(), self.config.heartbeat_interval_ms);
        let judged = match agent.state {
            AgentState::Ready => true,
            AgentState::Executing => agent.sandbox.manifest().allows(HostImport::Heartbeat),
            _ => false,
        };

        if judged && missed >= self.config.missed_heartbeat_threshold {
            agent.transition(LifecycleEvent::Faulted)?;
            agent.fault = Some(format!("missed {} heartbeat intervals", missed));
            if let Some(token) = agent.cancel.as_ref() {
                token.cancel();
            }
            warn!(agent = %agent_id, missed, "agent missed heartbeats");
            metrics::counter!("fabric_agent_faults_total").increment(1);
        }

        Ok(AgentHealth {
            agent_id,
            state: agent.state,
            healthy: agent.state.is_active(),
            missed_heartbeats: missed,
            last_heartbeat: agent.last_heartbeat(),
            fault: agent.fault.clone(),
        })
    }

    /// Health of every agent that is not terminated
    pub fn health_check_all(&self) -> Vec<AgentHealth> {
        self.agent_ids()
            .into_iter()
            .filter_map(|id| self.health_check(id).ok())
            .filter(|health| health.state != AgentState::Terminated)
            .collect()
    }

    /// Record a liveness signal for an agent
    pub fn heartbeat(&self, agent_id: AgentId) -> Result<()> {
        let slot = self.slot(agent_id)?;
        slot.agent.lock().touch();
        Ok(())
    }

    /// Refresh heartbeats of idle Ready agents; returns how many were touched
    pub fn refresh_idle_heartbeats(&self) -> usize {
        let slots: Vec<Arc<AgentSlot>> = self.agents.read().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| {
                let agent = slot.agent.lock();
                if agent.state == AgentState::Ready {
                    agent.touch();
                    true
                } else {
                    false
                }
            })
            .count()
    }

    /// Replace an agent's module, keeping its id and cumulative usage
    ///
    /// The new module is loaded first; if that fails the agent is untouched.
    /// An Executing agent finishes its current task before swapping.
    pub async fn hot_swap(&self, agent_id: AgentId, new_binary: &[u8]) -> Result<()> {
        let slot = self.slot(agent_id)?;
        let manifest = {
            let agent = slot.agent.lock();
            if !matches!(agent.state, AgentState::Ready | AgentState::Executing) {
                return Err(EngineError::AgentNotReady {
                    agent: agent_id,
                    state: agent.state,
                    expected: AgentState::Ready,
                });
            }
            agent.sandbox.manifest().clone()
        };

        let binary: Arc<[u8]> = Arc::from(new_binary);
        let sandbox = self.load(binary.clone(), manifest).await?;

        loop {
            {
                let mut agent = slot.agent.lock();
                match agent.state {
                    AgentState::Ready => {
                        agent.transition(LifecycleEvent::BeginDrain)?;
                        agent.sandbox = sandbox;
                        agent.binary = binary;
                        agent.swap_generation += 1;
                        agent.drain_requested = false;
                        agent.fault = None;
                        agent.transition(LifecycleEvent::Swapped)?;
                        agent.touch();

                        info!(
                            agent = %agent_id,
                            generation = agent.swap_generation,
                            digest = %agent.sandbox.digest(),
                            "agent hot-swapped"
                        );
                        break;
                    }
                    AgentState::Executing => {
                        agent.drain_requested = true;
                    }
                    state => {
                        agent.drain_requested = false;
                        return Err(EngineError::AgentNotReady {
                            agent: agent_id,
                            state,
                            expected: AgentState::Ready,
                        });
                    }
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), slot.idle.notified()).await;
        }

        slot.idle.notify_waiters();
        Ok(())
    }

    /// Cancel the agent's in-flight task, if any
    pub fn cancel(&self, agent_id: AgentId) -> Result<bool> {
        let slot = self.slot(agent_id)?;
        let agent = slot.agent.lock();
        match agent.cancel.as_ref() {
            Some(token) => {
                token.cancel();
                debug!(agent = %agent_id, task = ?agent.current_task, "cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel `task_id` if it is the agent's in-flight task
    ///
    /// Returns `false` when the agent is running something else or has not
    /// started the task yet.
    pub fn cancel_task(&self, agent_id: AgentId, task_id: TaskId) -> Result<bool> {
        let slot = self.slot(agent_id)?;
        let agent = slot.agent.lock();
        match (agent.current_task, agent.cancel.as_ref()) {
            (Some(current), Some(token)) if current == task_id => {
                token.cancel();
                debug!(agent = %agent_id, task = %task_id, "cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Terminate an agent, cancelling in-flight work first
    pub async fn shutdown(&self, agent_id: AgentId) -> Result<()> {
        let slot = self.slot(agent_id)?;
        let grace = self.config.shutdown_grace();
        let give_up = Instant::now() + grace;

        loop {
            {
                let agent = slot.agent.lock();
                match agent.state {
                    AgentState::Terminated => {
                        return Err(EngineError::InvalidTransition {
                            agent: agent_id,
                            from: AgentState::Terminated,
                            to: AgentState::Terminated,
                        })
                    }
                    AgentState::Executing if Instant::now() < give_up => {
                        if let Some(token) = agent.cancel.as_ref() {
                            token.cancel();
                        }
                    }
                    _ => break,
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), slot.idle.notified()).await;
        }

        {
            let mut agent = slot.agent.lock();
            if let Some(token) = agent.cancel.take() {
                token.cancel();
            }
            agent.transition(LifecycleEvent::Terminate)?;
            info!(agent = %agent_id, tasks_completed = agent.stats.tasks_completed, "agent terminated");
        }

        self.quota.release_agent_slot();
        slot.idle.notify_waiters();
        self.publish_gauges();
        Ok(())
    }

    /// Terminate an agent and spawn a fresh one with the same capability, quota and module
    pub async fn replace(&self, agent_id: AgentId) -> Result<AgentId> {
        let slot = self.slot(agent_id)?;
        let (capability, quota, binary, manifest, state) = {
            let agent = slot.agent.lock();
            (
                agent.capability.clone(),
                agent.quota.clone(),
                agent.binary.clone(),
                agent.sandbox.manifest().clone(),
                agent.state,
            )
        };

        if state != AgentState::Terminated {
            self.shutdown(agent_id).await?;
        }

        let replacement = self.spawn(capability, quota, &binary, &manifest).await?;
        info!(agent = %agent_id, replacement = %replacement, "agent replaced");
        Ok(replacement)
    }

    /// Terminate every agent that is still alive
    pub async fn shutdown_all(&self) {
        let live: Vec<AgentId> = self
            .snapshot_slots()
            .into_iter()
            .filter(|(_, slot)| slot.agent.lock().state != AgentState::Terminated)
            .map(|(id, _)| id)
            .collect();

        let results = futures::future::join_all(live.iter().map(|id| self.shutdown(*id))).await;
        for (id, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!(agent = %id, error = %e, "agent shutdown failed");
            }
        }
    }

    /// Drop terminated agents from the arena and evict compiled modules no
    /// remaining agent runs; returns the ids removed
    pub fn prune_terminated(&self) -> Vec<AgentId> {
        let (pruned, in_use) = {
            let mut agents = self.agents.write();
            let mut pruned = Vec::new();
            agents.retain(|id, slot| {
                let live = slot.agent.lock().state != AgentState::Terminated;
                if !live {
                    pruned.push(*id);
                }
                live
            });
            let in_use: HashSet<String> = agents
                .values()
                .map(|slot| slot.agent.lock().sandbox.digest().to_string())
                .collect();
            (pruned, in_use)
        };

        if !pruned.is_empty() {
            self.loader.retain_modules(&in_use);
        }
        pruned
    }

    fn snapshot_slots(&self) -> Vec<(AgentId, Arc<AgentSlot>)> {
        self.agents
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<AgentInfo> {
        self.slot(agent_id).ok().map(|slot| slot.agent.lock().info())
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .snapshot_slots()
            .into_iter()
            .map(|(_, slot)| slot.agent.lock().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Ready agents serving `capability`, oldest first, with their quotas
    pub fn idle_agents_for(&self, capability: &Capability) -> Vec<(AgentId, ResourceQuota)> {
        let mut idle: Vec<(AgentId, ResourceQuota)> = self
            .snapshot_slots()
            .into_iter()
            .filter_map(|(id, slot)| {
                let agent = slot.agent.lock();
                (agent.state == AgentState::Ready
                    && !agent.drain_requested
                    && agent.capability == *capability)
                    .then(|| (id, agent.quota.clone()))
            })
            .collect();
        idle.sort_by_key(|(id, _)| *id);
        idle
    }

    pub fn count_in(&self, state: AgentState) -> usize {
        self.snapshot_slots()
            .into_iter()
            .filter(|(_, slot)| slot.agent.lock().state == state)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.snapshot_slots()
            .into_iter()
            .filter(|(_, slot)| slot.agent.lock().state.is_active())
            .count()
    }

    pub fn unhealthy_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .snapshot_slots()
            .into_iter()
            .filter(|(_, slot)| slot.agent.lock().state == AgentState::Unhealthy)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    fn publish_gauges(&self) {
        metrics::gauge!("fabric_agents_active").set(self.active_count() as f64);
        metrics::gauge!("fabric_agents_unhealthy").set(self.count_in(AgentState::Unhealthy) as f64);
    }
}

fn outcome_to_result(
    task: &Task,
    agent_id: AgentId,
    joined: Joined,
    started: Instant,
    budget: Duration,
) -> (ExecutionResult, Option<Interruption>) {
    let invocation = match joined {
        Joined::Finished(invocation) => invocation,
        Joined::Panicked(reason) => {
            let result = ExecutionResult::failed(task.id(), Some(agent_id), format!("agent crashed: {}", reason))
                .with_execution_time(started.elapsed().as_millis() as u64);
            return (result, Some(Interruption::Crashed));
        }
        Joined::Abandoned => {
            let result = ExecutionResult::failed(
                task.id(),
                Some(agent_id),
                "agent did not stop within the cancellation grace period",
            )
            .with_execution_time(started.elapsed().as_millis() as u64);
            return (result, Some(Interruption::Forced));
        }
    };

    let elapsed_ms = invocation.elapsed.as_millis() as u64;
    let (result, interruption) = match invocation.outcome {
        InvocationOutcome::Completed(output) => (
            ExecutionResult::succeeded(task.id(), agent_id, output, elapsed_ms, invocation.usage),
            None,
        ),
        InvocationOutcome::GuestError(status) => (
            ExecutionResult::failed(task.id(), Some(agent_id), format!("agent returned status {}", status))
                .with_usage(invocation.usage),
            None,
        ),
        InvocationOutcome::Trapped(reason) => (
            ExecutionResult::failed(task.id(), Some(agent_id), format!("agent crashed: {}", reason))
                .with_usage(invocation.usage),
            Some(Interruption::Crashed),
        ),
        InvocationOutcome::Unsatisfiable(reason) => (
            ExecutionResult::failed(task.id(), Some(agent_id), format!("task limits rejected: {}", reason)),
            None,
        ),
        InvocationOutcome::Stopped(StopReason::Deadline) => (
            ExecutionResult::failed(task.id(), Some(agent_id), EngineError::ExecutionTimeout(budget).to_string())
                .with_usage(invocation.usage),
            Some(Interruption::Deadline),
        ),
        InvocationOutcome::Stopped(StopReason::Cancelled) => (
            ExecutionResult::failed(task.id(), Some(agent_id), "execution cancelled")
                .with_usage(invocation.usage),
            Some(Interruption::Cancelled),
        ),
    };

    (
        result
            .with_execution_time(elapsed_ms)
            .with_agent_metrics(invocation.metrics),
        interruption,
    )
}
