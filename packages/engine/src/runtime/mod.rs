// packages/engine/src/runtime/mod.rs
//! Agent execution runtime
//!
//! This module provides the sandboxed execution environment, including:
//!
//! - **Quota**: resource ceilings, admission and the in-flight ledger
//! - **Sandbox**: WebAssembly module validation and isolated invocation
//! - **Host**: the host functions a manifest can grant
//! - **Agent**: agent records and the lifecycle state machine
//! - **Executor**: the agent arena and lifecycle operations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Executor                        │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐           │
//! │  │ Agent    │  │ Agent    │  │ Agent    │  ...      │
//! │  │ (wasm)   │  │ (wasm)   │  │ (wasm)   │           │
//! │  └──────────┘  └──────────┘  └──────────┘           │
//! │        ▲             ▲             ▲                 │
//! │        └─────────────┴─────────────┘                 │
//! │                      │                               │
//! │        SandboxLoader (module cache, epoch ticker)    │
//! │                      │                               │
//! │        QuotaEnforcer (admission, in-flight ledger)   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod executor;
pub mod host;
pub mod quota;
pub mod sandbox;

// Re-export commonly used types
pub use agent::{AgentHealth, AgentInfo, AgentState, AgentStats, LifecycleEvent};
pub use executor::{DispatchError, Execution, Executor, Interruption};
pub use host::HostImport;
pub use quota::{Admission, InFlight, QuotaEnforcer, ResourceQuota};
pub use sandbox::{CapabilityManifest, SandboxHandle, SandboxLoader};
