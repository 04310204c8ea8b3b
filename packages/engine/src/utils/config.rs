// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate, later sources overriding earlier ones:
//!
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. `fabric.toml` in the working directory, if present
//! 3. The file named by `FABRIC_CONFIG` (TOML, YAML or JSON by extension)
//! 4. `FABRIC__<SECTION>__<KEY>` environment variables

use crate::runtime::quota::ResourceQuota;
use crate::runtime::sandbox::CapabilityManifest;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "fabric.toml";
const CONFIG_PATH_VAR: &str = "FABRIC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub quota: QuotaConfig,
    pub telemetry: TelemetryConfig,
    pub observability: ObservabilityConfig,

    /// Capability manifests keyed by capability tag
    pub manifests: HashMap<String, CapabilityManifest>,

    /// Agents spawned at start-up
    pub agents: Vec<AgentSpec>,
}

impl EngineConfig {
    /// Load from the default locations and the environment
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
        Self::load_from_path(explicit)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(PathBuf::from(DEFAULT_CONFIG_PATH)).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("FABRIC")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Manifest for a capability; keys from config files arrive lowercased
    pub fn manifest_for(&self, capability: &str) -> Option<&CapabilityManifest> {
        self.manifests
            .get(capability)
            .or_else(|| self.manifests.get(&capability.to_lowercase()))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::Config(msg));

        let s = &self.scheduler;
        if s.queue_capacity == 0 {
            return fail("scheduler.queue_capacity must be at least 1".into());
        }
        if s.max_attempts == 0 {
            return fail("scheduler.max_attempts must be at least 1".into());
        }
        if s.base_retry_delay_ms > s.max_retry_delay_ms {
            return fail("scheduler.base_retry_delay_ms exceeds max_retry_delay_ms".into());
        }
        if s.tick_interval_ms == 0 {
            return fail("scheduler.tick_interval_ms must be positive".into());
        }
        let cb = &s.circuit_breaker;
        if !(cb.failure_threshold > 0.0 && cb.failure_threshold <= 1.0) {
            return fail(format!(
                "scheduler.circuit_breaker.failure_threshold must be in (0, 1], got {}",
                cb.failure_threshold
            ));
        }
        if cb.window == 0 || cb.min_samples > cb.window {
            return fail("scheduler.circuit_breaker.min_samples must not exceed a non-empty window".into());
        }

        if self.executor.heartbeat_interval_ms == 0 {
            return fail("executor.heartbeat_interval_ms must be positive".into());
        }
        if self.executor.missed_heartbeat_threshold == 0 {
            return fail("executor.missed_heartbeat_threshold must be at least 1".into());
        }
        if self.executor.supervisor_interval_ms == 0 {
            return fail("executor.supervisor_interval_ms must be positive".into());
        }

        self.quota
            .global
            .validate()
            .map_err(|e| EngineError::Config(format!("quota.global: {}", e)))?;
        self.quota
            .per_agent_max
            .validate()
            .map_err(|e| EngineError::Config(format!("quota.per_agent_max: {}", e)))?;
        if self.quota.max_agents == 0 {
            return fail("quota.max_agents must be at least 1".into());
        }

        if self.telemetry.ring_capacity == 0 || self.telemetry.stripes == 0 {
            return fail("telemetry.ring_capacity and telemetry.stripes must be positive".into());
        }

        for spec in &self.agents {
            if self.manifest_for(&spec.capability).is_none() {
                return fail(format!(
                    "agent '{}' has no manifest under [manifests.{}]",
                    spec.module.display(),
                    spec.capability
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queued plus backing-off tasks accepted before `QueueFull`
    pub queue_capacity: usize,

    /// Total attempts per task, first one included
    pub max_attempts: u32,

    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub dead_letter_capacity: usize,

    /// Terminal results kept for polling
    pub result_retention: usize,

    pub tick_interval_ms: u64,

    /// How long shutdown lets queued work drain
    pub drain_timeout_ms: u64,

    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_attempts: 3,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 30_000,
            dead_letter_capacity: 1_000,
            result_retention: 10_000,
            tick_interval_ms: 250,
            drain_timeout_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Outcomes remembered per capability
    pub window: usize,

    /// Outcomes required before the circuit may open
    pub min_samples: usize,

    /// Failure rate that opens the circuit
    pub failure_threshold: f64,

    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown_ms: 5_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeat_threshold: u32,

    /// Time a cancelled guest gets to stop before it is abandoned
    pub cancel_grace_ms: u64,

    pub shutdown_grace_ms: u64,

    /// Respawn unhealthy agents with the same capability, quota and module
    pub replace_unhealthy: bool,

    pub supervisor_interval_ms: u64,

    pub sandbox: SandboxConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            missed_heartbeat_threshold: 3,
            cancel_grace_ms: 500,
            shutdown_grace_ms: 2_000,
            replace_unhealthy: true,
            supervisor_interval_ms: 1_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Epoch tick, the granularity of deadline and cancel checks
    pub epoch_tick_ms: u64,
    pub max_module_bytes: usize,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            epoch_tick_ms: 10,
            max_module_bytes: 64 * 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Ceiling shared by everything in flight
    pub global: ResourceQuota,

    /// Largest quota a single agent or task may ask for
    pub per_agent_max: ResourceQuota,

    pub max_agents: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            global: ResourceQuota {
                cpu_cores: 8.0,
                memory_mb: 8_192,
                max_execution_time_secs: 3_600,
                network_mbps: None,
            },
            per_agent_max: ResourceQuota::relaxed(),
            max_agents: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Most recent KPI reports retained
    pub ring_capacity: usize,

    /// Lock stripes for running aggregates
    pub stripes: usize,

    pub broadcast_capacity: usize,

    /// Emit through the `metrics` facade
    pub emit_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 10_000,
            stripes: 16,
            broadcast_capacity: 1_024,
            emit_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,
    pub log_format: LogFormat,

    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9090`
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

/// An agent to spawn at start-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub capability: String,

    /// Path to the agent's WebAssembly module
    pub module: PathBuf,

    #[serde(default)]
    pub quota: ResourceQuota,

    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn default_replicas() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::HostImport;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.scheduler.max_attempts = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_agent_without_manifest_is_rejected() {
        let mut config = EngineConfig::default();
        config.agents.push(AgentSpec {
            capability: "summarizer".into(),
            module: PathBuf::from("agents/summarizer.wasm"),
            quota: ResourceQuota::standard(),
            replicas: 1,
        });
        assert!(config.validate().is_err());

        config
            .manifests
            .insert("summarizer".into(), CapabilityManifest::new([HostImport::Log]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
max_attempts = 5
base_retry_delay_ms = 10

[executor]
replace_unhealthy = false

[manifests.summarizer]
imports = ["log", "heartbeat"]

[[agents]]
capability = "summarizer"
module = "agents/summarizer.wasm"
replicas = 2

[agents.quota]
cpu_cores = 0.5
memory_mb = 128
"#
        )
        .unwrap();

        let config = EngineConfig::load_from_path(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.queue_capacity, 10_000);
        assert!(!config.executor.replace_unhealthy);
        assert_eq!(config.agents[0].replicas, 2);
        assert_eq!(config.agents[0].quota.memory_mb, 128);
        assert_eq!(config.agents[0].quota.max_execution_time_secs, 300);
        assert!(config
            .manifest_for("summarizer")
            .unwrap()
            .allows(HostImport::Heartbeat));
    }
}
