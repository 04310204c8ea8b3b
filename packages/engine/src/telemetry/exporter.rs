// packages/engine/src/telemetry/exporter.rs
//! Export KPI reports and snapshots for downstream consumers
//!
//! Supports:
//! - JSON (a single array, for ad-hoc analysis)
//! - NDJSON (one report per line, for log shippers)
//! - Prometheus text (aggregates only)

use crate::telemetry::kpi::KpiReport;
use crate::telemetry::snapshot::MetricsSnapshot;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Ndjson,
    Prometheus,
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            other => Err(EngineError::Config(format!("unknown export format: {}", other))),
        }
    }
}

pub struct Exporter {
    format: ExportFormat,
}

impl Exporter {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    /// Render reports, with the snapshot they were drained alongside
    ///
    /// Prometheus output describes only the snapshot; the report formats
    /// ignore it.
    pub fn export(&self, reports: &[KpiReport], snapshot: &MetricsSnapshot) -> Result<String> {
        debug!(
            reports = reports.len(),
            format = ?self.format,
            "exporting kpi reports"
        );

        match self.format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(reports)?),
            ExportFormat::Ndjson => export_ndjson(reports),
            ExportFormat::Prometheus => Ok(snapshot.to_prometheus_text()),
        }
    }
}

fn export_ndjson(reports: &[KpiReport]) -> Result<String> {
    let mut out = String::new();
    for report in reports {
        out.push_str(&serde_json::to_string(report)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentId, ExecutionResult, ResourceUsage, TaskId};
    use crate::telemetry::collector::TelemetryCollector;
    use crate::telemetry::kpi::ExecutionContext;
    use crate::utils::config::TelemetryConfig;

    fn collector_with(n: u64) -> TelemetryCollector {
        let collector = TelemetryCollector::with_context(
            &TelemetryConfig {
                emit_metrics: false,
                ..Default::default()
            },
            ExecutionContext {
                hostname: "exporter".into(),
                available_cores: 1,
                available_memory_mb: 512,
                gpu_info: None,
                network_interfaces: Vec::new(),
            },
        );
        let agent = AgentId::new();
        for ms in 0..n {
            collector.record(&ExecutionResult::succeeded(
                TaskId::new(),
                agent,
                serde_json::json!({ "n": ms }),
                ms,
                ResourceUsage::default(),
            ));
        }
        collector
    }

    #[test]
    fn test_ndjson_is_one_report_per_line() {
        let collector = collector_with(3);
        let snapshot = collector.snapshot();
        let reports = collector.drain_reports();

        let text = Exporter::new(ExportFormat::Ndjson)
            .export(&reports, &snapshot)
            .unwrap();
        let parsed: Vec<KpiReport> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, reports);
    }

    #[test]
    fn test_json_is_an_array() {
        let collector = collector_with(2);
        let snapshot = collector.snapshot();
        let reports = collector.drain_reports();

        let text = Exporter::new(ExportFormat::Json)
            .export(&reports, &snapshot)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_prometheus_uses_snapshot() {
        let collector = collector_with(4);
        let text = Exporter::new(ExportFormat::Prometheus)
            .export(&[], &collector.snapshot())
            .unwrap();
        assert!(text.contains("fabric_tasks_processed_total 4"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("NDJSON".parse::<ExportFormat>().unwrap(), ExportFormat::Ndjson);
        assert_eq!("prom".parse::<ExportFormat>().unwrap(), ExportFormat::Prometheus);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
