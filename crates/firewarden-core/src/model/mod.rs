// ── Domain model ──
//
// Canonical types shared by the collaborator contracts, the trackers and
// the reconciliation algorithms.

pub mod common;
pub mod entity_id;
pub mod firewall;

// ── Re-exports ──────────────────────────────────────────────────────
// Flat access: `use firewarden_core::model::*` gives you everything.

pub use common::{EnvironConfig, Life, MachineInfo, UnitInfo};
pub use entity_id::{InstanceId, MachineId, NetworkName, ServiceName, UnitName};
pub use firewall::{FirewallMode, PortRange, Protocol, sort_port_ranges};
