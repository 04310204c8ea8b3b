// packages/engine/src/runtime/host.rs
//! Host functions exposed to sandboxed agents
//!
//! Agents see exactly the imports their capability manifest declares, all
//! under the `env` module:
//! - `log(ptr, len)`: UTF-8 message, emitted on the `sandbox` tracing target
//! - `now_ms() -> i64`: wall clock in Unix milliseconds
//! - `random() -> i32`: uniformly random 32 bits
//! - `heartbeat()`: liveness signal for long-running work
//! - `metric(name_ptr, name_len, value)`: custom KPI value

use crate::model::AgentId;
use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;
use wasmtime::{Caller, Engine, Extern, Linker, StoreLimits};

/// Module name every host import lives under
pub const HOST_MODULE: &str = "env";

/// Longest string a guest may pass to `log` or `metric`
const MAX_GUEST_STRING: usize = 64 * 1024;

/// Host imports a manifest can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostImport {
    Log,
    NowMs,
    Random,
    Heartbeat,
    Metric,
}

impl HostImport {
    pub const ALL: [HostImport; 5] = [
        HostImport::Log,
        HostImport::NowMs,
        HostImport::Random,
        HostImport::Heartbeat,
        HostImport::Metric,
    ];

    /// Import name as seen by the guest
    pub fn name(&self) -> &'static str {
        match self {
            HostImport::Log => "log",
            HostImport::NowMs => "now_ms",
            HostImport::Random => "random",
            HostImport::Heartbeat => "heartbeat",
            HostImport::Metric => "metric",
        }
    }

    /// Wasm signature, for diagnostics
    pub fn signature(&self) -> &'static str {
        match self {
            HostImport::Log => "(i32, i32) -> ()",
            HostImport::NowMs => "() -> i64",
            HostImport::Random => "() -> i32",
            HostImport::Heartbeat => "() -> ()",
            HostImport::Metric => "(i32, i32, f64) -> ()",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|import| import.name() == name)
    }

    /// Whether this import counts as a host I/O operation
    fn is_io(&self) -> bool {
        matches!(self, HostImport::Log)
    }
}

impl fmt::Display for HostImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", HOST_MODULE, self.name())
    }
}

impl FromStr for HostImport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("env.").unwrap_or(s);
        Self::from_name(name).ok_or_else(|| format!("unknown host import '{}'", s))
    }
}

/// Why the host stopped a running guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Cancelled,
}

/// Per-invocation store data
pub struct HostState {
    pub(crate) agent: AgentId,
    pub(crate) limits: StoreLimits,
    heartbeat: Arc<AtomicI64>,
    pub(crate) metrics: HashMap<String, f64>,
    pub(crate) io_ops: u64,
    pub(crate) stopped: Option<StopReason>,
}

impl HostState {
    pub fn new(agent: AgentId, limits: StoreLimits, heartbeat: Arc<AtomicI64>) -> Self {
        Self {
            agent,
            limits,
            heartbeat,
            metrics: HashMap::new(),
            io_ops: 0,
            stopped: None,
        }
    }

    fn count(&mut self, import: HostImport) {
        if import.is_io() {
            self.io_ops += 1;
        }
    }
}

fn read_guest_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let len = usize::try_from(len).context("negative string length")?;
    if len > MAX_GUEST_STRING {
        bail!("guest string of {} bytes exceeds {} byte limit", len, MAX_GUEST_STRING);
    }
    let offset = ptr as u32 as usize;

    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest exports no memory"))?;

    let mut buf = vec![0u8; len];
    memory.read(&*caller, offset, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Build a linker that provides only `granted` imports
pub fn build_linker(engine: &Engine, granted: &[HostImport]) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    for import in granted {
        match import {
            HostImport::Log => {
                linker.func_wrap(
                    HOST_MODULE,
                    import.name(),
                    |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
                        let message = read_guest_string(&mut caller, ptr, len)?;
                        caller.data_mut().count(HostImport::Log);
                        info!(target: "sandbox", agent = %caller.data().agent, "{}", message);
                        Ok(())
                    },
                )?;
            }
            HostImport::NowMs => {
                linker.func_wrap(HOST_MODULE, import.name(), || -> i64 {
                    Utc::now().timestamp_millis()
                })?;
            }
            HostImport::Random => {
                linker.func_wrap(HOST_MODULE, import.name(), || -> i32 { rand::random::<i32>() })?;
            }
            HostImport::Heartbeat => {
                linker.func_wrap(HOST_MODULE, import.name(), |caller: Caller<'_, HostState>| {
                    caller
                        .data()
                        .heartbeat
                        .store(Utc::now().timestamp_millis(), Ordering::Release);
                })?;
            }
            HostImport::Metric => {
                linker.func_wrap(
                    HOST_MODULE,
                    import.name(),
                    |mut caller: Caller<'_, HostState>,
                     name_ptr: i32,
                     name_len: i32,
                     value: f64|
                     -> anyhow::Result<()> {
                        let name = read_guest_string(&mut caller, name_ptr, name_len)?;
                        if value.is_finite() {
                            caller.data_mut().metrics.insert(name, value);
                        }
                        Ok(())
                    },
                )?;
            }
        }
    }

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_names() {
        assert_eq!(HostImport::Log.name(), "log");
        assert_eq!(HostImport::NowMs.name(), "now_ms");
        assert_eq!(HostImport::from_name("metric"), Some(HostImport::Metric));
        assert_eq!(HostImport::from_name("fd_write"), None);
    }

    #[test]
    fn test_parse_with_module_prefix() {
        assert_eq!("env.random".parse::<HostImport>().unwrap(), HostImport::Random);
        assert_eq!("heartbeat".parse::<HostImport>().unwrap(), HostImport::Heartbeat);
        assert!("wasi.fd_write".parse::<HostImport>().is_err());
        assert_eq!(HostImport::Random.to_string(), "env.random");
    }

    #[test]
    fn test_serde_names_match_guest_names() {
        for import in HostImport::ALL {
            let json = serde_json::to_string(&import).unwrap();
            assert_eq!(json, format!("\"{}\"", import.name()));
        }
    }

    #[test]
    fn test_linker_builds_for_every_import() {
        let engine = Engine::default();
        assert!(build_linker(&engine, &HostImport::ALL).is_ok());
        assert!(build_linker(&engine, &[]).is_ok());
    }
}
