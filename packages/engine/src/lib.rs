// packages/engine/src/lib.rs
//! Agent Execution Fabric
//!
//! Runs untrusted agent code as sandboxed WebAssembly instances under
//! strict resource quotas, schedules prioritized tasks onto them, and
//! reports per-execution KPIs.
//!
//! # Architecture
//!
//! - **model**: tasks, priorities, identifiers and execution results
//! - **runtime**: quota enforcement, sandbox loading, agent lifecycle
//! - **scheduler**: priority queue, retries, circuit breakers, dead letters
//! - **telemetry**: KPI reports, aggregates and exporters
//! - **fabric**: the facade composing all of the above
//! - **observability**: tracing and Prometheus installation
//! - **utils**: configuration and errors
//!
//! ```no_run
//! use fabric_engine::{EngineConfig, Fabric, Task};
//!
//! # async fn demo() -> fabric_engine::Result<()> {
//! let fabric = Fabric::new(EngineConfig::load()?).await?;
//! let id = fabric
//!     .submit_task(Task::new("summarize", serde_json::json!({ "text": "..." })))
//!     .await?;
//! let result = fabric.get_result(id).await?;
//! println!("success: {}", result.success);
//! fabric.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod fabric;
pub mod model;
pub mod observability;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use fabric::{Fabric, FabricHealth, FabricStatus};
pub use model::{
    AgentId, Capability, ExecutionResult, Priority, ResourceUsage, Task, TaskId, TaskRequest,
};
pub use runtime::{AgentState, CapabilityManifest, HostImport, ResourceQuota};
pub use scheduler::{DeadLetterRecord, TaskStatus};
pub use telemetry::{KpiReport, MetricsSnapshot};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, LoadError, RejectionReason, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build metadata stamped by `build.rs`
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(!info.git_hash.is_empty());
        assert!(!info.rustc_version.is_empty());
    }
}
