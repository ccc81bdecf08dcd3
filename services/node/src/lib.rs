//! # nex-node
//!
//! Node-local supervisor that hosts short-lived, isolated workloads inside
//! micro VMs, driven entirely over a messaging-bus control plane.
//!
//! ## Architecture
//!
//! ```text
//! ApiListener ($NEX.PING/INFO/DEPLOY/STOP)
//!   └── MachineManager
//!       ├── warm pool (channel of N pre-started VMs)
//!       ├── AgentChannel (agentint.* request–reply with in-VM agents)
//!       ├── PayloadCache (remote store → NEXCACHE)
//!       └── trigger bindings (external subjects → agent execution)
//! ```
//!
//! The bus, hypervisor, and network plumbing are capabilities injected by the
//! surrounding runtime; tests run against the in-process implementations.
//!
//! ## Modules
//!
//! - `bus`: bus capability and the in-process `MemoryBus`
//! - `claims`: node identity, signed workload claims, environment envelopes
//! - `machines`: warm pool, deployment binding, machine lifecycle
//! - `control`: operator-facing request–reply listener
//! - `trigger`: trigger-subject fan-in to agents

pub mod agent;
pub mod bus;
pub mod claims;
pub mod config;
pub mod control;
pub mod error;
pub mod launcher;
pub mod machines;
pub mod payload;
pub mod telemetry;
pub mod trigger;

// Re-export commonly used types
pub use bus::{Bus, MemoryBus};
pub use claims::NodeKeys;
pub use config::NodeConfig;
pub use control::ApiListener;
pub use error::NodeError;
pub use launcher::{MockLauncher, VmLauncher};
pub use machines::MachineManager;
pub use telemetry::Telemetry;
