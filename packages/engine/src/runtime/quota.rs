// packages/engine/src/runtime/quota.rs
//! Resource quotas and the in-flight quota ledger
//!
//! Provides:
//! - CPU ceilings (fractional cores)
//! - Memory ceilings (MB)
//! - Wall-clock ceilings (seconds per execution)
//! - Network bandwidth ceilings (Mbps, optional)
//!
//! Admission is pure policy. The ledger tracks what dispatched tasks hold
//! right now and refuses a charge rather than overshoot the global budget.

use crate::model::AgentId;
use crate::utils::config::QuotaConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Resource ceiling for an agent or a task
///
/// `network_mbps: None` on a ceiling means unlimited; on a request it
/// means no bandwidth is reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuota {
    /// CPU share in cores (0.5 = half a core)
    pub cpu_cores: f64,

    pub memory_mb: u64,

    /// Wall-clock ceiling for a single execution
    pub max_execution_time_secs: u64,

    pub network_mbps: Option<u64>,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::standard()
    }
}

impl ResourceQuota {
    pub fn standard() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            max_execution_time_secs: 300,
            network_mbps: Some(10),
        }
    }

    /// Tight limits for untrusted code
    pub fn strict() -> Self {
        Self {
            cpu_cores: 0.25,
            memory_mb: 256,
            max_execution_time_secs: 60,
            network_mbps: Some(10),
        }
    }

    /// Generous limits for development
    pub fn relaxed() -> Self {
        Self {
            cpu_cores: 4.0,
            memory_mb: 2048,
            max_execution_time_secs: 3600,
            network_mbps: None,
        }
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.cpu_cores.is_finite() || self.cpu_cores < 0.0 {
            return Err(format!("CPU cores must be a non-negative number, got {}", self.cpu_cores));
        }
        if self.cpu_cores == 0.0 {
            return Err("CPU cores cannot be 0".to_string());
        }
        if self.memory_mb == 0 {
            return Err("memory cannot be 0".to_string());
        }
        if self.max_execution_time_secs == 0 {
            return Err("max execution time cannot be 0".to_string());
        }
        if self.network_mbps == Some(0) {
            return Err("network bandwidth cannot be 0, omit it instead".to_string());
        }
        Ok(())
    }

    /// Whether the capacity of `other` (cpu, memory, network) fits inside `self`
    ///
    /// Execution time is not compared: dispatch runs under the smaller of
    /// the two time budgets.
    pub fn covers(&self, other: &ResourceQuota) -> bool {
        let network_fits = match (self.network_mbps, other.network_mbps) {
            (None, _) | (Some(_), None) => true,
            (Some(ceiling), Some(wanted)) => wanted <= ceiling,
        };

        other.cpu_cores <= self.cpu_cores
            && other.memory_mb <= self.memory_mb
            && network_fits
    }

    /// First dimension of `self` that exceeds `ceiling`, described for humans
    fn first_excess(&self, ceiling: &ResourceQuota, label: &str) -> Option<String> {
        if self.cpu_cores > ceiling.cpu_cores {
            return Some(format!(
                "cpu {} cores exceeds {} limit of {}",
                self.cpu_cores, label, ceiling.cpu_cores
            ));
        }
        if self.memory_mb > ceiling.memory_mb {
            return Some(format!(
                "memory {}MB exceeds {} limit of {}MB",
                self.memory_mb, label, ceiling.memory_mb
            ));
        }
        if self.max_execution_time_secs > ceiling.max_execution_time_secs {
            return Some(format!(
                "execution time {}s exceeds {} limit of {}s",
                self.max_execution_time_secs, label, ceiling.max_execution_time_secs
            ));
        }
        if let (Some(wanted), Some(limit)) = (self.network_mbps, ceiling.network_mbps) {
            if wanted > limit {
                return Some(format!(
                    "network {}Mbps exceeds {} limit of {}Mbps",
                    wanted, label, limit
                ));
            }
        }
        None
    }
}

/// Outcome of quota admission
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Ledger totals held by dispatched tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InFlight {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub network_mbps: u64,
    pub tasks: usize,
}

impl InFlight {
    fn add(&mut self, quota: &ResourceQuota) {
        self.cpu_cores += quota.cpu_cores;
        self.memory_mb += quota.memory_mb;
        self.network_mbps += quota.network_mbps.unwrap_or(0);
        self.tasks += 1;
    }

    fn remove(&mut self, quota: &ResourceQuota) {
        self.cpu_cores = (self.cpu_cores - quota.cpu_cores).max(0.0);
        self.memory_mb = self.memory_mb.saturating_sub(quota.memory_mb);
        self.network_mbps = self
            .network_mbps
            .saturating_sub(quota.network_mbps.unwrap_or(0));
        self.tasks = self.tasks.saturating_sub(1);
    }
}

fn millicores(cores: f64) -> u64 {
    (cores * 1000.0).round().max(0.0) as u64
}

/// Add `amount` to `counter` unless the result would pass `limit`
fn try_reserve(counter: &AtomicU64, amount: u64, limit: u64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_add(amount).filter(|next| *next <= limit)
        })
        .is_ok()
}

fn give_back(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(amount))
    });
}

/// Quota policy plus the live ledger
///
/// The ledger is the only globally shared mutable state in the fabric.
pub struct QuotaEnforcer {
    global: ResourceQuota,
    per_agent_max: ResourceQuota,
    max_agents: usize,

    cpu_millicores: AtomicU64,
    memory_mb: AtomicU64,
    network_mbps: AtomicU64,

    per_agent: DashMap<AgentId, InFlight>,
    live_agents: AtomicUsize,
}

impl QuotaEnforcer {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            global: config.global,
            per_agent_max: config.per_agent_max,
            max_agents: config.max_agents,
            cpu_millicores: AtomicU64::new(0),
            memory_mb: AtomicU64::new(0),
            network_mbps: AtomicU64::new(0),
            per_agent: DashMap::new(),
            live_agents: AtomicUsize::new(0),
        }
    }

    pub fn global(&self) -> &ResourceQuota {
        &self.global
    }

    pub fn per_agent_max(&self) -> &ResourceQuota {
        &self.per_agent_max
    }

    /// Check a requested quota against a global ceiling and the per-agent maximum
    pub fn admit(&self, requested: &ResourceQuota, global: &ResourceQuota) -> Admission {
        if let Err(reason) = requested.validate() {
            return Admission::Rejected(reason);
        }
        if let Some(reason) = requested.first_excess(global, "global") {
            return Admission::Rejected(reason);
        }
        if let Some(reason) = requested.first_excess(&self.per_agent_max, "per-agent") {
            return Admission::Rejected(reason);
        }
        Admission::Admitted
    }

    /// Admit against the configured global budget
    pub fn admit_configured(&self, requested: &ResourceQuota) -> Admission {
        self.admit(requested, &self.global)
    }

    /// Reserve `quota` for `agent`; false when the global budget would be exceeded
    pub fn charge(&self, agent: AgentId, quota: &ResourceQuota) -> bool {
        let cpu = millicores(quota.cpu_cores);
        let network = quota.network_mbps.unwrap_or(0);
        let network_limit = self.global.network_mbps.unwrap_or(u64::MAX);

        if !try_reserve(&self.cpu_millicores, cpu, millicores(self.global.cpu_cores)) {
            trace!(agent = %agent, "charge refused: cpu budget");
            return false;
        }
        if !try_reserve(&self.memory_mb, quota.memory_mb, self.global.memory_mb) {
            give_back(&self.cpu_millicores, cpu);
            trace!(agent = %agent, "charge refused: memory budget");
            return false;
        }
        if !try_reserve(&self.network_mbps, network, network_limit) {
            give_back(&self.cpu_millicores, cpu);
            give_back(&self.memory_mb, quota.memory_mb);
            trace!(agent = %agent, "charge refused: network budget");
            return false;
        }

        self.per_agent.entry(agent).or_default().add(quota);
        self.publish();
        debug!(agent = %agent, cpu_cores = quota.cpu_cores, memory_mb = quota.memory_mb, "quota charged");
        true
    }

    /// Return a previous charge to the budget
    pub fn release(&self, agent: AgentId, quota: &ResourceQuota) {
        give_back(&self.cpu_millicores, millicores(quota.cpu_cores));
        give_back(&self.memory_mb, quota.memory_mb);
        give_back(&self.network_mbps, quota.network_mbps.unwrap_or(0));

        let now_empty = match self.per_agent.get_mut(&agent) {
            Some(mut held) => {
                held.remove(quota);
                held.tasks == 0
            }
            None => false,
        };
        if now_empty {
            self.per_agent.remove_if(&agent, |_, held| held.tasks == 0);
        }

        self.publish();
        debug!(agent = %agent, "quota released");
    }

    pub fn in_flight(&self) -> InFlight {
        InFlight {
            cpu_cores: self.cpu_millicores.load(Ordering::Acquire) as f64 / 1000.0,
            memory_mb: self.memory_mb.load(Ordering::Acquire),
            network_mbps: self.network_mbps.load(Ordering::Acquire),
            tasks: self.per_agent.iter().map(|entry| entry.tasks).sum(),
        }
    }

    pub fn agent_in_flight(&self, agent: AgentId) -> Option<InFlight> {
        self.per_agent.get(&agent).map(|held| held.clone())
    }

    /// Claim a live-agent slot; false when `max_agents` are already live
    pub fn reserve_agent_slot(&self) -> bool {
        let max = self.max_agents;
        self.live_agents
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    pub fn release_agent_slot(&self) {
        let _ = self
            .live_agents
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(1))
            });
    }

    pub fn live_agents(&self) -> usize {
        self.live_agents.load(Ordering::Acquire)
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    fn publish(&self) {
        let totals = self.in_flight();
        metrics::gauge!("fabric_quota_cpu_cores_in_flight").set(totals.cpu_cores);
        metrics::gauge!("fabric_quota_memory_mb_in_flight").set(totals.memory_mb as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enforcer() -> QuotaEnforcer {
        QuotaEnforcer::new(QuotaConfig {
            global: ResourceQuota {
                cpu_cores: 2.0,
                memory_mb: 1024,
                max_execution_time_secs: 600,
                network_mbps: Some(20),
            },
            per_agent_max: ResourceQuota::relaxed(),
            max_agents: 2,
        })
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ResourceQuota::standard().validate().is_ok());
        assert!(ResourceQuota::strict().validate().is_ok());
        assert!(ResourceQuota::relaxed().validate().is_ok());
        assert!(ResourceQuota::relaxed().covers(&ResourceQuota::strict()));
        assert!(!ResourceQuota::strict().covers(&ResourceQuota::standard()));

        let short = ResourceQuota {
            max_execution_time_secs: 1,
            ..ResourceQuota::standard()
        };
        assert!(short.covers(&ResourceQuota::standard()));
    }

    #[test]
    fn test_validation() {
        let zero_cpu = ResourceQuota {
            cpu_cores: 0.0,
            ..ResourceQuota::standard()
        };
        assert!(zero_cpu.validate().is_err());

        let zero_time = ResourceQuota {
            max_execution_time_secs: 0,
            ..ResourceQuota::standard()
        };
        assert!(zero_time.validate().is_err());

        let zero_memory = ResourceQuota {
            memory_mb: 0,
            ..ResourceQuota::standard()
        };
        assert_eq!(zero_memory.validate(), Err("memory cannot be 0".to_string()));

        let negative = ResourceQuota {
            cpu_cores: -1.0,
            ..ResourceQuota::standard()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_admission() {
        let enforcer = enforcer();
        let global = enforcer.global().clone();

        assert!(enforcer.admit(&ResourceQuota::standard(), &global).is_admitted());

        let too_much_memory = ResourceQuota {
            memory_mb: 4096,
            ..ResourceQuota::standard()
        };
        match enforcer.admit(&too_much_memory, &global) {
            Admission::Rejected(reason) => assert!(reason.contains("memory")),
            Admission::Admitted => panic!("oversized memory admitted"),
        }
    }

    #[test]
    fn test_charge_refuses_instead_of_exceeding() {
        let enforcer = enforcer();
        let agent = AgentId::new();
        let quota = ResourceQuota::standard();

        assert!(enforcer.charge(agent, &quota));
        assert!(enforcer.charge(agent, &quota));
        // 3 cores requested of 2
        assert!(!enforcer.charge(agent, &quota));

        let totals = enforcer.in_flight();
        assert_eq!(totals.cpu_cores, 2.0);
        assert_eq!(totals.memory_mb, 1024);
        assert_eq!(totals.tasks, 2);

        enforcer.release(agent, &quota);
        enforcer.release(agent, &quota);
        assert_eq!(enforcer.in_flight(), InFlight::default());
        assert!(enforcer.agent_in_flight(agent).is_none());
    }

    #[test]
    fn test_agent_slots() {
        let enforcer = enforcer();
        assert!(enforcer.reserve_agent_slot());
        assert!(enforcer.reserve_agent_slot());
        assert!(!enforcer.reserve_agent_slot());
        enforcer.release_agent_slot();
        assert!(enforcer.reserve_agent_slot());
        assert_eq!(enforcer.live_agents(), 2);
    }

    #[test]
    fn test_concurrent_charges_never_exceed_budget() {
        let enforcer = std::sync::Arc::new(enforcer());
        let quota = ResourceQuota {
            cpu_cores: 0.25,
            memory_mb: 64,
            max_execution_time_secs: 10,
            network_mbps: None,
        };

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let enforcer = enforcer.clone();
                let quota = quota.clone();
                std::thread::spawn(move || enforcer.charge(AgentId::new(), &quota))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();

        assert_eq!(granted, 8);
        assert!(enforcer.in_flight().cpu_cores <= 2.0);
    }

    proptest! {
        #[test]
        fn prop_ledger_returns_to_zero(charges in proptest::collection::vec((1u64..1500, 1u64..400), 1..20)) {
            let enforcer = enforcer();
            let agent = AgentId::new();
            let mut held = Vec::new();

            for (milli, memory) in charges {
                let quota = ResourceQuota {
                    cpu_cores: milli as f64 / 1000.0,
                    memory_mb: memory,
                    max_execution_time_secs: 1,
                    network_mbps: None,
                };
                if enforcer.charge(agent, &quota) {
                    held.push(quota);
                }
                let totals = enforcer.in_flight();
                prop_assert!(totals.cpu_cores <= 2.0 + 1e-9);
                prop_assert!(totals.memory_mb <= 1024);
            }

            for quota in &held {
                enforcer.release(agent, quota);
            }
            prop_assert_eq!(enforcer.in_flight(), InFlight::default());
        }
    }
}
