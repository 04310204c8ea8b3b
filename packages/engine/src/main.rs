// packages/engine/src/main.rs
//! Agent Execution Fabric daemon
//!
//! Loads configuration, installs logging and metrics, spawns the configured
//! agents and runs until Ctrl-C, then drains and shuts down.

use anyhow::{Context, Result};
use fabric_engine::observability::{init_metrics, init_tracing};
use fabric_engine::{BuildInfo, EngineConfig, Fabric, FabricStatus};
use std::time::Duration;
use tracing::{info, warn};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("loading configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        rustc = build.rustc_version,
        "starting agent execution fabric"
    );
    info!(
        agents = config.agents.len(),
        manifests = config.manifests.len(),
        queue_capacity = config.scheduler.queue_capacity,
        "configuration loaded"
    );

    let fabric = Fabric::new(config).await.context("starting fabric")?;

    let mut health_log = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("installing Ctrl-C handler")?;
                info!("received shutdown signal, draining");
                break;
            }
            _ = health_log.tick() => {
                let health = fabric.get_health().await;
                let snapshot = fabric.get_metrics_snapshot();
                if health.status == FabricStatus::Healthy {
                    info!(
                        status = %health.status,
                        active_agents = health.active_agent_count,
                        queued = health.queued_task_count,
                        processed = snapshot.processed,
                        mean_latency_ms = snapshot.mean_latency_ms,
                        "health"
                    );
                } else {
                    warn!(
                        status = %health.status,
                        active_agents = health.active_agent_count,
                        unhealthy_agents = health.unhealthy_agent_count,
                        open_circuits = ?health.open_circuits,
                        queued = health.queued_task_count,
                        "health"
                    );
                }
            }
        }
    }

    fabric.shutdown().await;
    info!("fabric stopped cleanly");
    Ok(())
}
