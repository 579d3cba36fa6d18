// ── Trackers and their forwarders ──
//
// Trackers are plain records in the engine's registries, linked by id.
// Machine and service trackers each own one supervised forwarder task that
// relays a single kind of external change into the engine's inbox.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FirewallError;
use crate::model::{MachineId, NetworkName, PortRange, ServiceName, UnitName};
use crate::state::{DeclaredPorts, NotifyWatcher, StateSource, StringsWatcher};
use crate::supervisor::TaskHandle;

/// A machine's unit list changed.
#[derive(Debug)]
pub(crate) struct UnitsChange {
    pub machine: MachineId,
    pub generation: u64,
    pub units: Vec<String>,
}

/// A service's exposure flag changed.
#[derive(Debug)]
pub(crate) struct ExposedChange {
    pub service: ServiceName,
    pub generation: u64,
    pub exposed: bool,
}

#[derive(Debug)]
pub(crate) struct MachineTracker {
    pub id: MachineId,
    /// Distinguishes this registration from earlier ones of the same id.
    pub generation: u64,
    pub units: BTreeSet<UnitName>,
    pub defined_ports: BTreeMap<NetworkName, DeclaredPorts>,
    /// Last set pushed to the provider, sorted.
    pub applied: Vec<PortRange>,
    pub watch: Option<TaskHandle>,
}

impl MachineTracker {
    pub fn new(id: MachineId, generation: u64) -> Self {
        Self {
            id,
            generation,
            units: BTreeSet::new(),
            defined_ports: BTreeMap::new(),
            applied: Vec::new(),
            watch: None,
        }
    }
}

impl Drop for MachineTracker {
    fn drop(&mut self) {
        if let Some(watch) = &self.watch {
            watch.stop();
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UnitTracker {
    pub name: UnitName,
    pub machine: MachineId,
    pub service: ServiceName,
}

#[derive(Debug)]
pub(crate) struct ServiceTracker {
    pub name: ServiceName,
    pub generation: u64,
    pub exposed: bool,
    pub units: BTreeSet<UnitName>,
    pub watch: TaskHandle,
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        self.watch.stop();
    }
}

// ── Forwarders ──────────────────────────────────────────────────────

/// Relay unit-list changes for one machine until stopped.
pub(crate) async fn forward_units(
    machine: MachineId,
    generation: u64,
    mut watcher: StringsWatcher,
    inbox: mpsc::Sender<UnitsChange>,
    stop: CancellationToken,
) -> Result<(), FirewallError> {
    loop {
        let units = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            change = watcher.next() => match change {
                Some(units) => units,
                None => return Err(FirewallError::watcher_closed(watcher.name())),
            },
        };
        let change = UnitsChange {
            machine: machine.clone(),
            generation,
            units,
        };
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            sent = inbox.send(change) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Relay exposure flips for one service until stopped or the service
/// disappears. Repeated values are suppressed.
pub(crate) async fn forward_exposed(
    state: Arc<dyn StateSource>,
    service: ServiceName,
    generation: u64,
    mut exposed: bool,
    mut watcher: NotifyWatcher,
    inbox: mpsc::Sender<ExposedChange>,
    stop: CancellationToken,
) -> Result<(), FirewallError> {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            change = watcher.next() => {
                if change.is_none() {
                    return Err(FirewallError::watcher_closed(watcher.name()));
                }
            }
        }

        let current = match state.service_exposed(&service).await {
            Ok(current) => current,
            Err(err) if err.is_not_found() => {
                debug!(service = %service, "service removed, stopping exposure watch");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if current == exposed {
            continue;
        }
        exposed = current;

        let change = ExposedChange {
            service: service.clone(),
            generation,
            exposed,
        };
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            sent = inbox.send(change) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
