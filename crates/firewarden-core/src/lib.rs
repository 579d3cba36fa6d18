//! Firewall reconciliation engine.
//!
//! Watches the declared state of a cluster (machines, units, service
//! exposure and the port ranges units declare) and drives the provider's
//! firewall into agreement with it:
//!
//! - **[`Firewaller`]**: the managed engine. A single controller loop owns
//!   all tracker state; per-machine and per-service forwarder tasks feed it
//!   changes. Per-instance and global (reference counted) port strategies
//!   are selected from the environment's firewall mode.
//!
//! - **[`Supervisor`]**: the supervision tree every engine task belongs to.
//!   One failure cancels everything and is reported from `wait()`.
//!
//! - **Collaborator contracts** ([`state`]): [`StateSource`] for the cluster
//!   store, [`EnvironProvider`] / [`Environ`] / [`Instance`] for the cloud.
//!
//! - **In-memory collaborators** ([`memory`]): deterministic doubles used by
//!   the simulator and the test suite.

pub mod error;
pub mod firewaller;
pub mod memory;
pub mod model;
pub mod state;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::{FirewallError, ModelError};
pub use firewaller::{Firewaller, FirewallerConfig};
pub use state::{Environ, EnvironProvider, Instance, StateSource, Watcher};
pub use supervisor::{Supervisor, TaskHandle};

pub use model::{
    EnvironConfig, FirewallMode, InstanceId, Life, MachineId, MachineInfo, NetworkName, PortRange,
    Protocol, ServiceName, UnitInfo, UnitName,
};
