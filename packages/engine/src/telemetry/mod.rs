// packages/engine/src/telemetry/mod.rs
//! Execution telemetry
//!
//! - `kpi`: per-execution reports and the host context they carry
//! - `collector`: bounded report ring plus striped running aggregates
//! - `snapshot`: point-in-time aggregate views, Prometheus rendering
//! - `exporter`: JSON / NDJSON / Prometheus export

pub mod collector;
pub mod exporter;
pub mod kpi;
pub mod snapshot;

pub use collector::TelemetryCollector;
pub use exporter::{ExportFormat, Exporter};
pub use kpi::{ExecutionContext, GpuInfo, KpiReport, ACCURACY_METRIC};
pub use snapshot::{AgentGauge, HistogramBucket, MetricsSnapshot, RingStats};
