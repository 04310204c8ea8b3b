// packages/engine/tests/common/mod.rs
//! Shared fixtures for integration tests

#![allow(dead_code)]

use fabric_engine::utils::config::{CircuitBreakerConfig, ExecutorConfig, SchedulerConfig, TelemetryConfig};
use fabric_engine::{
    AgentId, Capability, CapabilityManifest, EngineConfig, ExecutionResult, Fabric, HostImport,
    ResourceQuota, TaskId,
};
use std::future::Future;
use std::time::Duration;

/// Writes `{"status":"ok"}` at offset 16 and returns it
pub const OK: &str = r#"
    (module
      (memory (export "memory") 1)
      (data (i32.const 16) "{\"status\":\"ok\"}")
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        i64.const 68719476751))
"#;

/// Returns its input unchanged
pub const ECHO: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param $ptr i32) (param $len i32) (result i64)
        (i64.or
          (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
          (i64.extend_i32_u (local.get $len)))))
"#;

/// Always reports a guest error
pub const FAIL: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64) i64.const -1))
"#;

/// Never returns
pub const SPIN: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        (loop $l (br $l))
        i64.const 0))
"#;

/// Busy-waits 300 ms on `env.now_ms`, then returns `{"status":"ok"}`
pub const SLOW: &str = r#"
    (module
      (import "env" "now_ms" (func $now (result i64)))
      (memory (export "memory") 1)
      (data (i32.const 16) "{\"status\":\"ok\"}")
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        (local $until i64)
        (local.set $until (i64.add (call $now) (i64.const 300)))
        (block $done
          (loop $wait
            (br_if $done (i64.ge_s (call $now) (local.get $until)))
            (br $wait)))
        i64.const 68719476751))
"#;

/// Like [`OK`] but starts with 32 pages (2 MiB) of memory
pub const LARGE_MEMORY: &str = r#"
    (module
      (memory (export "memory") 32)
      (data (i32.const 16) "{\"status\":\"ok\"}")
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        i64.const 68719476751))
"#;

/// Reports accuracy 0.75 and returns no output
pub const ACCURACY: &str = r#"
    (module
      (import "env" "metric" (func $metric (param i32 i32 f64)))
      (memory (export "memory") 1)
      (data (i32.const 16) "accuracy")
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        (call $metric (i32.const 16) (i32.const 8) (f64.const 0.75))
        i64.const 0))
"#;

/// Imports `env.random`, which no default manifest grants
pub const UNDECLARED: &str = r#"
    (module
      (import "env" "random" (func $random (result i32)))
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) i32.const 1024)
      (func (export "run") (param i32 i32) (result i64)
        (drop (call $random))
        i64.const 0))
"#;

pub fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).unwrap()
}

/// Fast timers, no automatic replacement, a breaker that only opens on a
/// full window of failures
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig {
        scheduler: SchedulerConfig {
            base_retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            tick_interval_ms: 10,
            drain_timeout_ms: 200,
            circuit_breaker: CircuitBreakerConfig {
                window: 20,
                min_samples: 20,
                failure_threshold: 1.0,
                cooldown_ms: 60_000,
            },
            ..Default::default()
        },
        executor: ExecutorConfig {
            cancel_grace_ms: 200,
            shutdown_grace_ms: 500,
            replace_unhealthy: false,
            supervisor_interval_ms: 50,
            ..Default::default()
        },
        telemetry: TelemetryConfig {
            emit_metrics: false,
            ..Default::default()
        },
        ..Default::default()
    };
    config
        .manifests
        .insert("echo".into(), CapabilityManifest::default());
    config
        .manifests
        .insert("scored".into(), CapabilityManifest::new([HostImport::Metric]));
    config
}

pub async fn fabric_with(config: EngineConfig) -> Fabric {
    Fabric::new(config).await.unwrap()
}

pub async fn spawn(fabric: &Fabric, wat: &str, capability: &str, quota: ResourceQuota) -> AgentId {
    fabric
        .spawn_agent_with_manifest(
            &wasm(wat),
            Capability::from(capability),
            quota,
            &CapabilityManifest::permissive(),
        )
        .await
        .unwrap()
}

/// Fail the test instead of hanging
pub async fn within<F: Future>(secs: u64, future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), future)
        .await
        .expect("timed out")
}

pub async fn result(fabric: &Fabric, id: TaskId) -> ExecutionResult {
    within(10, fabric.get_result(id)).await.unwrap()
}

/// Poll every 5 ms until `condition` holds, failing after 10 s
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(10, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
