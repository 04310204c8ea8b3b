// packages/engine/src/runtime/agent.rs
//! Agent records and the lifecycle state machine
//!
//! ```text
//! Uninitialized → Initializing → Ready ⇄ Executing
//!                                Ready → Draining → Ready      (hot swap)
//!                   Ready | Executing → Unhealthy
//!              any non-terminated state → Terminated
//! ```

use crate::model::{AgentId, Capability, ResourceUsage, TaskId};
use crate::runtime::quota::ResourceQuota;
use crate::runtime::sandbox::SandboxHandle;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Draining,
    Unhealthy,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Executing => "executing",
            AgentState::Draining => "draining",
            AgentState::Unhealthy => "unhealthy",
            AgentState::Terminated => "terminated",
        }
    }

    /// Counted as live for capacity and health reporting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentState::Ready | AgentState::Executing | AgentState::Draining
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move an agent between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeginInit,
    Initialized,
    Dispatched,
    Finished,
    BeginDrain,
    Swapped,
    Faulted,
    Terminate,
}

impl LifecycleEvent {
    /// State the event leads to when it is legal
    pub fn target(&self) -> AgentState {
        match self {
            LifecycleEvent::BeginInit => AgentState::Initializing,
            LifecycleEvent::Initialized => AgentState::Ready,
            LifecycleEvent::Dispatched => AgentState::Executing,
            LifecycleEvent::Finished => AgentState::Ready,
            LifecycleEvent::BeginDrain => AgentState::Draining,
            LifecycleEvent::Swapped => AgentState::Ready,
            LifecycleEvent::Faulted => AgentState::Unhealthy,
            LifecycleEvent::Terminate => AgentState::Terminated,
        }
    }
}

/// Whether `event` is legal in state `from`
pub fn is_legal(from: AgentState, event: LifecycleEvent) -> bool {
    use AgentState::*;
    use LifecycleEvent::*;

    matches!(
        (from, event),
        (Uninitialized, BeginInit)
            | (Initializing, Initialized)
            | (Ready, Dispatched)
            | (Executing, Finished)
            | (Ready, BeginDrain)
            | (Draining, Swapped)
            | (Ready | Executing, Faulted)
            | (
                Uninitialized | Initializing | Ready | Executing | Draining | Unhealthy,
                Terminate
            )
    )
}

/// Execution statistics kept per agent
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub mean_execution_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl AgentStats {
    pub fn record(&mut self, success: bool, execution_ms: u64, at: DateTime<Utc>) {
        let previous = self.tasks_completed + self.tasks_failed;
        self.mean_execution_ms =
            (self.mean_execution_ms * previous as f64 + execution_ms as f64) / (previous + 1) as f64;

        if success {
            self.tasks_completed += 1;
            self.last_success = Some(at);
        } else {
            self.tasks_failed += 1;
            self.last_failure = Some(at);
        }
    }
}

/// A live agent, owned by the executor
pub struct Agent {
    pub(crate) id: AgentId,
    pub(crate) capability: Capability,
    pub(crate) state: AgentState,
    pub(crate) quota: ResourceQuota,
    pub(crate) usage: ResourceUsage,
    pub(crate) heartbeat: Arc<AtomicI64>,
    pub(crate) sandbox: SandboxHandle,
    pub(crate) binary: Arc<[u8]>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) swap_generation: u64,
    pub(crate) stats: AgentStats,
    pub(crate) fault: Option<String>,
    pub(crate) current_task: Option<TaskId>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) drain_requested: bool,
}

impl Agent {
    pub(crate) fn new(
        capability: Capability,
        quota: ResourceQuota,
        sandbox: SandboxHandle,
        binary: Arc<[u8]>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            capability,
            state: AgentState::Uninitialized,
            quota,
            usage: ResourceUsage::default(),
            heartbeat: Arc::new(AtomicI64::new(now.timestamp_millis())),
            sandbox,
            binary,
            created_at: now,
            swap_generation: 0,
            stats: AgentStats::default(),
            fault: None,
            current_task: None,
            cancel: None,
            drain_requested: false,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Apply a lifecycle event, refusing illegal ones
    pub fn transition(&mut self, event: LifecycleEvent) -> Result<AgentState> {
        if !is_legal(self.state, event) {
            return Err(EngineError::InvalidTransition {
                agent: self.id,
                from: self.state,
                to: event.target(),
            });
        }
        self.state = event.target();
        Ok(self.state)
    }

    pub fn touch(&self) {
        self.heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.heartbeat.load(Ordering::Acquire))
            .unwrap_or(self.created_at)
    }

    /// Whole heartbeat intervals elapsed since the last heartbeat
    pub fn missed_intervals(&self, now: DateTime<Utc>, interval_ms: u64) -> u32 {
        if interval_ms == 0 {
            return 0;
        }
        let silent = (now.timestamp_millis() - self.heartbeat.load(Ordering::Acquire)).max(0) as u64;
        u32::try_from(silent / interval_ms).unwrap_or(u32::MAX)
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id,
            capability: self.capability.clone(),
            state: self.state,
            quota: self.quota.clone(),
            usage: self.usage.clone(),
            last_heartbeat: self.last_heartbeat(),
            created_at: self.created_at,
            swap_generation: self.swap_generation,
            module_digest: self.sandbox.digest().to_string(),
            stats: self.stats.clone(),
            fault: self.fault.clone(),
            current_task: self.current_task,
        }
    }
}

/// Read-only snapshot of an agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub capability: Capability,
    pub state: AgentState,
    pub quota: ResourceQuota,
    pub usage: ResourceUsage,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub swap_generation: u64,
    pub module_digest: String,
    pub stats: AgentStats,
    pub fault: Option<String>,
    pub current_task: Option<TaskId>,
}

/// Result of a health check
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub healthy: bool,
    pub missed_heartbeats: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub fault: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;
    use LifecycleEvent::*;

    const STATES: [AgentState; 7] = [
        Uninitialized,
        Initializing,
        Ready,
        Executing,
        Draining,
        Unhealthy,
        Terminated,
    ];

    #[test]
    fn test_happy_path() {
        let mut state = Uninitialized;
        for event in [BeginInit, Initialized, Dispatched, Finished, BeginDrain, Swapped, Terminate] {
            assert!(is_legal(state, event), "{} should accept {:?}", state, event);
            state = event.target();
        }
        assert_eq!(state, Terminated);
    }

    #[test]
    fn test_terminated_is_final() {
        for event in [BeginInit, Initialized, Dispatched, Finished, BeginDrain, Swapped, Faulted, Terminate] {
            assert!(!is_legal(Terminated, event));
        }
    }

    #[test]
    fn test_unhealthy_only_terminates() {
        for event in [BeginInit, Initialized, Dispatched, Finished, BeginDrain, Swapped, Faulted] {
            assert!(!is_legal(Unhealthy, event));
        }
        assert!(is_legal(Unhealthy, Terminate));
    }

    #[test]
    fn test_faults_only_from_ready_or_executing() {
        for state in STATES {
            let expected = matches!(state, Ready | Executing);
            assert_eq!(is_legal(state, Faulted), expected, "fault from {}", state);
        }
    }

    #[test]
    fn test_stats_mean() {
        let mut stats = AgentStats::default();
        let now = Utc::now();
        stats.record(true, 10, now);
        stats.record(false, 30, now);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert!((stats.mean_execution_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.last_failure, Some(now));
    }
}
