// ── Collaborator contracts ──
//
// The engine consumes two external systems: the cluster state store (entity
// accessors plus change feeds) and the cloud provider (port control on
// instances or on the whole environment). Both are narrow async traits so
// the engine can run against a live backend or the in-memory doubles in
// `crate::memory`.

pub mod watcher;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FirewallError;
use crate::model::{
    EnvironConfig, InstanceId, MachineId, MachineInfo, NetworkName, PortRange, ServiceName,
    UnitInfo, UnitName,
};

pub use watcher::{NotifyWatcher, StringsWatcher, WatchSender, Watcher, channel};

/// Declared port ranges on one (machine, network) pair, keyed by range.
pub type DeclaredPorts = BTreeMap<PortRange, UnitName>;

/// Read access to declared cluster state plus its change feeds.
///
/// Every `watch_*` subscription delivers one initial event describing the
/// current state before any incremental change. Accessors report vanished
/// entities with [`FirewallError::NotFound`].
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn watch_environ_config(&self) -> Result<NotifyWatcher, FirewallError>;

    async fn environ_config(&self) -> Result<EnvironConfig, FirewallError>;

    /// Machine ids whose lifecycle changed.
    async fn watch_machines(&self) -> Result<StringsWatcher, FirewallError>;

    /// Port-change keys of the form `machine:network`.
    async fn watch_opened_ports(&self) -> Result<StringsWatcher, FirewallError>;

    async fn machine(&self, id: &MachineId) -> Result<MachineInfo, FirewallError>;

    /// Names of units assigned to (or leaving) the machine.
    async fn watch_units(&self, machine: &MachineId) -> Result<StringsWatcher, FirewallError>;

    /// Provider instance backing the machine, or `NotProvisioned`.
    async fn instance_id(&self, machine: &MachineId) -> Result<InstanceId, FirewallError>;

    /// Networks the machine currently has ports declared on.
    async fn active_networks(&self, machine: &MachineId)
    -> Result<Vec<NetworkName>, FirewallError>;

    async fn opened_ports(
        &self,
        machine: &MachineId,
        network: &NetworkName,
    ) -> Result<DeclaredPorts, FirewallError>;

    async fn unit(&self, name: &UnitName) -> Result<UnitInfo, FirewallError>;

    async fn service_exposed(&self, service: &ServiceName) -> Result<bool, FirewallError>;

    /// Fires whenever anything about the service changes.
    async fn watch_service(&self, service: &ServiceName) -> Result<NotifyWatcher, FirewallError>;
}

/// An opened provider environment.
#[async_trait]
pub trait Environ: Send + Sync {
    fn config(&self) -> EnvironConfig;

    /// Apply a changed configuration to the live environment.
    async fn set_config(&self, config: EnvironConfig) -> Result<(), FirewallError>;

    /// Resolve a provider instance, or `NoInstances`.
    async fn instance(&self, id: &InstanceId) -> Result<Arc<dyn Instance>, FirewallError>;

    // ── Environment-scoped port control (global mode) ──

    async fn open_ports(&self, ranges: &[PortRange]) -> Result<(), FirewallError>;

    async fn close_ports(&self, ranges: &[PortRange]) -> Result<(), FirewallError>;

    async fn ports(&self) -> Result<Vec<PortRange>, FirewallError>;
}

/// A single provider instance with its own firewall.
#[async_trait]
pub trait Instance: Send + Sync {
    fn id(&self) -> InstanceId;

    async fn open_ports(
        &self,
        machine: &MachineId,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError>;

    async fn close_ports(
        &self,
        machine: &MachineId,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError>;

    async fn ports(&self, machine: &MachineId) -> Result<Vec<PortRange>, FirewallError>;
}

/// Opens provider environments from configuration.
#[async_trait]
pub trait EnvironProvider: Send + Sync {
    async fn open(&self, config: EnvironConfig) -> Result<Arc<dyn Environ>, FirewallError>;
}
