// packages/engine/src/runtime/sandbox.rs
//! WebAssembly sandbox for untrusted agent code
//!
//! Provides:
//! - Module validation (header, guest ABI exports, declared imports only)
//! - Content-addressed handles with a compiled-module cache
//! - Memory ceilings via store limits
//! - Deadline and cancellation checks at every epoch tick
//!
//! # Guest ABI
//!
//! ```text
//! (export "memory" (memory 1))
//! (export "alloc" (func (param i32) (result i32)))
//! (export "run"   (func (param i32 i32) (result i64)))
//! ```
//!
//! The host writes the JSON payload into memory returned by `alloc` and
//! calls `run(ptr, len)`. A non-negative return packs `(out_ptr << 32) | out_len`;
//! a negative return is a task failure carrying that status code.

use crate::model::{AgentId, ResourceUsage};
use crate::runtime::host::{build_linker, HostImport, HostState, StopReason, HOST_MODULE};
use crate::utils::config::SandboxConfig;
use crate::utils::errors::LoadError;
use anyhow::{anyhow, bail, Context};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wasmtime::{
    Engine, ExternType, InstancePre, Module, Store, StoreContextMut, StoreLimitsBuilder,
    UpdateDeadline, ValType,
};

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_PAGE_BYTES: u64 = 64 * 1024;

/// Host imports an agent binary is allowed to use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub imports: Vec<HostImport>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CapabilityManifest {
    pub fn new(imports: impl IntoIterator<Item = HostImport>) -> Self {
        let mut imports: Vec<HostImport> = imports.into_iter().collect();
        imports.dedup();
        Self {
            imports,
            ..Default::default()
        }
    }

    /// Grant every host import
    pub fn permissive() -> Self {
        Self::new(HostImport::ALL)
    }

    pub fn allows(&self, import: HostImport) -> bool {
        self.imports.contains(&import)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, LoadError> {
        serde_yaml::from_str(text)
            .map_err(|e| LoadError::InvalidModule(format!("invalid manifest: {}", e)))
    }

    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        serde_json::from_str(text)
            .map_err(|e| LoadError::InvalidModule(format!("invalid manifest: {}", e)))
    }

    /// Load a manifest file, JSON when the extension says so, YAML otherwise
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoadError::InvalidModule(format!("cannot read manifest {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }
}

/// Background thread advancing the engine epoch
///
/// Every running guest reaches an epoch checkpoint once per tick, which is
/// where deadlines and cancellation are observed.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("fabric-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self {
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Validates agent binaries and produces sandbox handles
pub struct SandboxLoader {
    engine: Engine,
    config: SandboxConfig,
    modules: DashMap<String, Module>,
    _ticker: EpochTicker,
}

impl SandboxLoader {
    pub fn new(config: SandboxConfig) -> Result<Self, LoadError> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.epoch_interruption(true);

        let engine = Engine::new(&engine_config).map_err(|e| LoadError::Engine(e.to_string()))?;
        let ticker = EpochTicker::start(engine.clone(), Duration::from_millis(config.epoch_tick_ms.max(1)))
            .map_err(|e| LoadError::Engine(format!("cannot start epoch ticker: {}", e)))?;

        Ok(Self {
            engine,
            config,
            modules: DashMap::new(),
            _ticker: ticker,
        })
    }

    /// Number of compiled modules held in the cache
    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    /// Drop compiled modules whose digest is not in `in_use`
    ///
    /// Handles already issued keep their module alive; only the cache
    /// entry goes. Returns how many entries were dropped.
    pub fn retain_modules(&self, in_use: &HashSet<String>) -> usize {
        let before = self.modules.len();
        self.modules.retain(|digest, _| in_use.contains(digest));
        let dropped = before.saturating_sub(self.modules.len());
        if dropped > 0 {
            debug!(dropped, cached = self.modules.len(), "compiled modules evicted");
        }
        dropped
    }

    pub fn load(&self, binary: &[u8], manifest: &CapabilityManifest) -> Result<SandboxHandle, LoadError> {
        if binary.len() > self.config.max_module_bytes {
            return Err(LoadError::InvalidModule(format!(
                "module is {} bytes, limit is {}",
                binary.len(),
                self.config.max_module_bytes
            )));
        }
        if binary.len() < 8 || &binary[..4] != WASM_MAGIC {
            return Err(LoadError::InvalidModule("missing WebAssembly header".to_string()));
        }

        let digest = hex::encode(Sha256::digest(binary));
        let module = self.compile(&digest, binary)?;

        check_imports(&module, manifest)?;
        check_exports(&module)?;
        let min_memory_bytes = initial_memory_bytes(&module);

        let linker = build_linker(&self.engine, &manifest.imports)
            .map_err(|e| LoadError::Engine(e.to_string()))?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| LoadError::InvalidModule(format!("{:#}", e)))?;

        debug!(digest = %digest, imports = manifest.imports.len(), "sandbox module loaded");

        Ok(SandboxHandle {
            inner: Arc::new(HandleInner {
                digest,
                manifest: manifest.clone(),
                pre,
                engine: self.engine.clone(),
                max_output_bytes: self.config.max_output_bytes,
                min_memory_bytes,
            }),
        })
    }

    fn compile(&self, digest: &str, binary: &[u8]) -> Result<Module, LoadError> {
        if let Some(module) = self.modules.get(digest) {
            return Ok(module.clone());
        }

        let module = Module::from_binary(&self.engine, binary)
            .map_err(|e| LoadError::InvalidModule(format!("{:#}", e)))?;
        self.modules.insert(digest.to_string(), module.clone());
        Ok(module)
    }
}

fn check_imports(module: &Module, manifest: &CapabilityManifest) -> Result<(), LoadError> {
    for import in module.imports() {
        let granted = (import.module() == HOST_MODULE)
            .then(|| HostImport::from_name(import.name()))
            .flatten()
            .filter(|host| manifest.allows(*host));

        if granted.is_none() {
            return Err(LoadError::CapabilityViolation {
                module: import.module().to_string(),
                name: import.name().to_string(),
            });
        }
    }
    Ok(())
}

fn export_signature(module: &Module, name: &str) -> Option<(Vec<ValType>, Vec<ValType>)> {
    match module.get_export(name) {
        Some(ExternType::Func(ty)) => Some((ty.params().collect(), ty.results().collect())),
        _ => None,
    }
}

fn initial_memory_bytes(module: &Module) -> usize {
    match module.get_export("memory") {
        Some(ExternType::Memory(ty)) => {
            usize::try_from(ty.minimum().saturating_mul(WASM_PAGE_BYTES)).unwrap_or(usize::MAX)
        }
        _ => 0,
    }
}

fn check_exports(module: &Module) -> Result<(), LoadError> {
    if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
        return Err(LoadError::MissingExport("memory".to_string()));
    }

    let alloc_ok = export_signature(module, "alloc").is_some_and(|(params, results)| {
        matches!(params.as_slice(), [ValType::I32]) && matches!(results.as_slice(), [ValType::I32])
    });
    if !alloc_ok {
        return Err(LoadError::MissingExport("alloc".to_string()));
    }

    let run_ok = export_signature(module, "run").is_some_and(|(params, results)| {
        matches!(params.as_slice(), [ValType::I32, ValType::I32])
            && matches!(results.as_slice(), [ValType::I64])
    });
    if !run_ok {
        return Err(LoadError::MissingExport("run".to_string()));
    }
    Ok(())
}

struct HandleInner {
    digest: String,
    manifest: CapabilityManifest,
    pre: InstancePre<HostState>,
    engine: Engine,
    max_output_bytes: usize,
    /// Initial size of the exported memory
    min_memory_bytes: usize,
}

/// Immutable, cheaply cloneable reference to a validated module
///
/// Every invocation instantiates a fresh store, so executions share no
/// guest state.
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<HandleInner>,
}

impl PartialEq for SandboxHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.digest == other.inner.digest && self.inner.manifest == other.inner.manifest
    }
}

impl Eq for SandboxHandle {}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("digest", &self.inner.digest)
            .field("imports", &self.inner.manifest.imports)
            .finish()
    }
}

/// Limits and signals for a single invocation
#[derive(Debug, Clone)]
pub struct InvocationLimits {
    pub agent: AgentId,
    pub deadline: Instant,
    pub memory_bytes: usize,
    pub cancel: CancellationToken,
    pub heartbeat: Arc<AtomicI64>,
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed(serde_json::Value),

    /// Guest returned a negative status
    GuestError(i64),

    /// Guest trapped or broke the ABI
    Trapped(String),

    /// The invocation's limits cannot hold the module; nothing ran
    Unsatisfiable(String),

    /// Host stopped the guest at an epoch checkpoint
    Stopped(StopReason),
}

/// Outcome plus what it cost
#[derive(Debug, Clone)]
pub struct Invocation {
    pub outcome: InvocationOutcome,
    pub usage: ResourceUsage,
    pub metrics: HashMap<String, f64>,
    pub elapsed: Duration,
}

struct GuestReturn {
    status: Option<i64>,
    output: Vec<u8>,
    memory_bytes: usize,
}

impl SandboxHandle {
    /// Hex SHA-256 of the module bytes
    pub fn digest(&self) -> &str {
        &self.inner.digest
    }

    pub fn manifest(&self) -> &CapabilityManifest {
        &self.inner.manifest
    }

    /// Smallest memory limit the module can be instantiated under
    pub fn min_memory_bytes(&self) -> usize {
        self.inner.min_memory_bytes
    }

    /// Run the guest to completion, trap, deadline or cancellation
    ///
    /// Blocks the calling thread; callers on an async runtime should use a
    /// blocking worker.
    pub fn invoke(&self, payload: &serde_json::Value, limits: InvocationLimits) -> Invocation {
        let started = Instant::now();
        if limits.memory_bytes < self.inner.min_memory_bytes {
            return Invocation {
                outcome: InvocationOutcome::Unsatisfiable(format!(
                    "memory limit of {} bytes is below the module's initial memory of {} bytes",
                    limits.memory_bytes, self.inner.min_memory_bytes
                )),
                usage: ResourceUsage::default(),
                metrics: HashMap::new(),
                elapsed: started.elapsed(),
            };
        }
        let input = serde_json::to_vec(payload).unwrap_or_else(|_| b"null".to_vec());

        let store_limits = StoreLimitsBuilder::new()
            .memory_size(limits.memory_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(
            &self.inner.engine,
            HostState::new(limits.agent, store_limits, limits.heartbeat.clone()),
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);

        let cancel = limits.cancel.clone();
        let deadline = limits.deadline;
        store.epoch_deadline_callback(move |mut ctx: StoreContextMut<'_, HostState>| {
            let reason = if cancel.is_cancelled() {
                Some(StopReason::Cancelled)
            } else if Instant::now() >= deadline {
                Some(StopReason::Deadline)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    ctx.data_mut().stopped = Some(reason);
                    Err(anyhow!("guest stopped: {:?}", reason))
                }
                None => Ok(UpdateDeadline::Continue(1)),
            }
        });

        let called = self.call_guest(&mut store, &input);
        let elapsed = started.elapsed();
        let state = store.into_data();

        let mut usage = ResourceUsage {
            cpu_seconds: elapsed.as_secs_f64(),
            network_rx_bytes: input.len() as u64,
            disk_io_ops: state.io_ops,
            ..Default::default()
        };

        let outcome = match called {
            Ok(ret) => {
                usage.memory_peak_mb = ret.memory_bytes as f64 / (1024.0 * 1024.0);
                usage.network_tx_bytes = ret.output.len() as u64;
                match ret.status {
                    Some(status) => InvocationOutcome::GuestError(status),
                    None => InvocationOutcome::Completed(parse_output(&ret.output)),
                }
            }
            Err(err) => match state.stopped {
                Some(reason) => InvocationOutcome::Stopped(reason),
                None => {
                    warn!(agent = %limits.agent, error = %format!("{:#}", err), "guest trapped");
                    InvocationOutcome::Trapped(format!("{:#}", err))
                }
            },
        };

        Invocation {
            outcome,
            usage,
            metrics: state.metrics,
            elapsed,
        }
    }

    fn call_guest(&self, store: &mut Store<HostState>, input: &[u8]) -> anyhow::Result<GuestReturn> {
        let instance = self.inner.pre.instantiate(&mut *store)?;
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| anyhow!("guest exports no memory"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
        let run = instance.get_typed_func::<(i32, i32), i64>(&mut *store, "run")?;

        let len = i32::try_from(input.len()).context("payload too large for guest")?;
        let ptr = alloc.call(&mut *store, len)?;
        memory
            .write(&mut *store, ptr as u32 as usize, input)
            .context("alloc returned an out-of-bounds pointer")?;

        let packed = run.call(&mut *store, (ptr, len))?;
        let memory_bytes = memory.data_size(&*store);

        if packed < 0 {
            return Ok(GuestReturn {
                status: Some(packed),
                output: Vec::new(),
                memory_bytes,
            });
        }

        let out_ptr = (packed >> 32) as u32 as usize;
        let out_len = (packed & 0xFFFF_FFFF) as usize;
        if out_len > self.inner.max_output_bytes {
            bail!(
                "guest output of {} bytes exceeds {} byte limit",
                out_len,
                self.inner.max_output_bytes
            );
        }

        let mut output = vec![0u8; out_len];
        memory
            .read(&*store, out_ptr, &mut output)
            .context("guest output out of bounds")?;

        Ok(GuestReturn {
            status: None,
            output,
            memory_bytes,
        })
    }
}

/// Guest output as JSON, or as a string when it isn't JSON
fn parse_output(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
