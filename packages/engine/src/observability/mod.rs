// packages/engine/src/observability/mod.rs
//! Process-wide logging and metrics installation
//!
//! Both initialisers are idempotent in effect: a second call reports an
//! error instead of replacing the installed subscriber or recorder.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| EngineError::Observability(format!("invalid log filter: {}", e)))?;

    let installed = match config.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };

    installed.map_err(|e| EngineError::Observability(format!("tracing already initialised: {}", e)))
}

/// Install the Prometheus recorder and scrape endpoint
///
/// Returns `false` without installing anything when no address is
/// configured; the `metrics` macros are then no-ops. Must run inside a
/// tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<bool> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(false);
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Observability(format!("invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Observability(format!("prometheus exporter: {}", e)))?;

    info!(%addr, "prometheus exporter listening");
    Ok(true)
}
