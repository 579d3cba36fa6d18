// ── In-memory state store ──
//
// Entities live in `DashMap`s; every mutation fans out to the subscribers
// of the affected feeds. Subscribers that stopped are pruned on the next
// notification.

use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::error::FirewallError;
use crate::model::{
    EnvironConfig, InstanceId, Life, MachineId, MachineInfo, NetworkName, PortRange, ServiceName,
    UnitInfo, UnitName,
};
use crate::state::{
    DeclaredPorts, NotifyWatcher, StateSource, StringsWatcher, WatchSender, Watcher, channel,
};

#[derive(Debug, Clone)]
struct MachineRecord {
    life: Life,
    instance: Option<InstanceId>,
}

#[derive(Debug, Clone)]
struct UnitRecord {
    service: ServiceName,
    life: Life,
    machine: Option<MachineId>,
}

/// Subscribers of one feed.
#[derive(Debug)]
struct Fanout<T> {
    senders: Mutex<Vec<WatchSender<T>>>,
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Fanout<T> {
    fn subscribe(&self, name: String, initial: T) -> Watcher<T> {
        let (tx, watcher) = channel(name);
        tx.send(initial);
        self.lock().push(tx);
        watcher
    }

    fn notify(&self, change: &T) {
        self.lock().retain(|tx| tx.send(change.clone()));
    }

    fn active(&self) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_stopped());
        senders.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WatchSender<T>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic state store for simulations and tests.
#[derive(Debug)]
pub struct MemoryState {
    environ_config: RwLock<EnvironConfig>,
    machines: DashMap<MachineId, MachineRecord>,
    units: DashMap<UnitName, UnitRecord>,
    services: DashMap<ServiceName, bool>,
    ports: DashMap<(MachineId, NetworkName), DeclaredPorts>,

    environ_watchers: Fanout<()>,
    machine_watchers: Fanout<Vec<String>>,
    ports_watchers: Fanout<Vec<String>>,
    unit_watchers: DashMap<MachineId, Fanout<Vec<String>>>,
    service_watchers: DashMap<ServiceName, Fanout<()>>,
}

impl MemoryState {
    pub fn new(config: EnvironConfig) -> Self {
        Self {
            environ_config: RwLock::new(config),
            machines: DashMap::new(),
            units: DashMap::new(),
            services: DashMap::new(),
            ports: DashMap::new(),
            environ_watchers: Fanout::default(),
            machine_watchers: Fanout::default(),
            ports_watchers: Fanout::default(),
            unit_watchers: DashMap::new(),
            service_watchers: DashMap::new(),
        }
    }

    // ── Environment ──────────────────────────────────────────────────

    pub fn set_environ_config(&self, config: EnvironConfig) {
        *self
            .environ_config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        self.environ_watchers.notify(&());
    }

    // ── Machines ─────────────────────────────────────────────────────

    pub fn add_machine(&self, id: impl Into<MachineId>) -> MachineId {
        let id = id.into();
        self.machines.insert(
            id.clone(),
            MachineRecord {
                life: Life::Alive,
                instance: None,
            },
        );
        trace!(machine = %id, "added machine");
        self.machine_watchers.notify(&vec![id.to_string()]);
        id
    }

    pub fn set_machine_life(&self, id: &MachineId, life: Life) -> Result<(), FirewallError> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| FirewallError::not_found("machine", id))?
            .life = life;
        self.machine_watchers.notify(&vec![id.to_string()]);
        Ok(())
    }

    pub fn remove_machine(&self, id: &MachineId) -> Result<(), FirewallError> {
        self.machines
            .remove(id)
            .ok_or_else(|| FirewallError::not_found("machine", id))?;
        self.machine_watchers.notify(&vec![id.to_string()]);
        Ok(())
    }

    /// Mark the machine provisioned on the given instance.
    pub fn set_instance_id(
        &self,
        id: &MachineId,
        instance: impl Into<InstanceId>,
    ) -> Result<(), FirewallError> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| FirewallError::not_found("machine", id))?
            .instance = Some(instance.into());
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────────────

    pub fn add_service(&self, name: impl Into<ServiceName>, exposed: bool) -> ServiceName {
        let name = name.into();
        self.services.insert(name.clone(), exposed);
        self.notify_service(&name);
        name
    }

    pub fn set_exposed(&self, name: &ServiceName, exposed: bool) -> Result<(), FirewallError> {
        *self
            .services
            .get_mut(name)
            .ok_or_else(|| FirewallError::not_found("service", name))? = exposed;
        self.notify_service(name);
        Ok(())
    }

    pub fn remove_service(&self, name: &ServiceName) -> Result<(), FirewallError> {
        self.services
            .remove(name)
            .ok_or_else(|| FirewallError::not_found("service", name))?;
        self.notify_service(name);
        Ok(())
    }

    fn notify_service(&self, name: &ServiceName) {
        if let Some(fanout) = self.service_watchers.get(name) {
            fanout.notify(&());
        }
    }

    // ── Units ────────────────────────────────────────────────────────

    /// Add an unassigned unit. The service must exist.
    pub fn add_unit(&self, name: &str) -> Result<UnitName, FirewallError> {
        let name = UnitName::parse(name)?;
        let service = name.service();
        if !self.services.contains_key(&service) {
            return Err(FirewallError::not_found("service", service));
        }
        self.units.insert(
            name.clone(),
            UnitRecord {
                service,
                life: Life::Alive,
                machine: None,
            },
        );
        Ok(name)
    }

    /// Put a unit on a machine. Ranges it declared on another machine move
    /// with it, and are rejected if they clash with ranges already declared
    /// on the target.
    pub fn assign_unit(&self, name: &UnitName, machine: &MachineId) -> Result<(), FirewallError> {
        if !self.machines.contains_key(machine) {
            return Err(FirewallError::not_found("machine", machine));
        }
        let previous = self
            .units
            .get(name)
            .ok_or_else(|| FirewallError::not_found("unit", name))?
            .machine
            .clone()
            .filter(|previous| previous != machine);
        let moving = match &previous {
            Some(previous) => self.declared_by(previous, name),
            None => Vec::new(),
        };
        self.check_free(machine, name, &moving)?;

        if let Some(mut unit) = self.units.get_mut(name) {
            unit.machine = Some(machine.clone());
        }
        if let Some(previous) = previous {
            let touched = self.move_ports(name, &previous, machine, moving);
            if !touched.is_empty() {
                self.ports_watchers.notify(&touched);
            }
            self.notify_units(&previous, name);
        }
        self.notify_units(machine, name);
        Ok(())
    }

    /// Ranges a unit declared on a machine, per network.
    fn declared_by(
        &self,
        machine: &MachineId,
        unit: &UnitName,
    ) -> Vec<(NetworkName, Vec<PortRange>)> {
        self.ports
            .iter()
            .filter(|entry| entry.key().0 == *machine)
            .filter_map(|entry| {
                let ranges: Vec<PortRange> = entry
                    .value()
                    .iter()
                    .filter(|(_, owner)| *owner == unit)
                    .map(|(range, _)| *range)
                    .collect();
                (!ranges.is_empty()).then(|| (entry.key().1.clone(), ranges))
            })
            .collect()
    }

    fn check_free(
        &self,
        machine: &MachineId,
        unit: &UnitName,
        moving: &[(NetworkName, Vec<PortRange>)],
    ) -> Result<(), FirewallError> {
        for (network, ranges) in moving {
            let Some(declared) = self.ports.get(&(machine.clone(), network.clone())) else {
                continue;
            };
            for range in ranges {
                if let Some(owner) = declared.get(range).filter(|owner| *owner != unit) {
                    return Err(FirewallError::PortConflict {
                        range: range.to_string(),
                        network: network.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Re-key a unit's ranges from one machine to another and return the
    /// ports keys that changed.
    fn move_ports(
        &self,
        unit: &UnitName,
        from: &MachineId,
        to: &MachineId,
        moving: Vec<(NetworkName, Vec<PortRange>)>,
    ) -> Vec<String> {
        let mut touched = Vec::new();
        for (network, ranges) in moving {
            let old_key = (from.clone(), network.clone());
            if let Some(mut declared) = self.ports.get_mut(&old_key) {
                for range in &ranges {
                    declared.remove(range);
                }
            }
            self.ports.remove_if(&old_key, |_, declared| declared.is_empty());

            self.ports
                .entry((to.clone(), network.clone()))
                .or_default()
                .extend(ranges.into_iter().map(|range| (range, unit.clone())));
            touched.push(ports_key(from, &network));
            touched.push(ports_key(to, &network));
        }
        touched
    }

    pub fn unassign_unit(&self, name: &UnitName) -> Result<(), FirewallError> {
        let previous = self
            .units
            .get_mut(name)
            .ok_or_else(|| FirewallError::not_found("unit", name))?
            .machine
            .take();
        if let Some(previous) = previous {
            self.notify_units(&previous, name);
        }
        Ok(())
    }

    pub fn set_unit_life(&self, name: &UnitName, life: Life) -> Result<(), FirewallError> {
        let machine = {
            let mut unit = self
                .units
                .get_mut(name)
                .ok_or_else(|| FirewallError::not_found("unit", name))?;
            unit.life = life;
            unit.machine.clone()
        };
        if let Some(machine) = machine {
            self.notify_units(&machine, name);
        }
        Ok(())
    }

    /// Remove a unit along with any ports it declared.
    pub fn remove_unit(&self, name: &UnitName) -> Result<(), FirewallError> {
        let (_, unit) = self
            .units
            .remove(name)
            .ok_or_else(|| FirewallError::not_found("unit", name))?;

        let mut touched = Vec::new();
        self.ports.retain(|(machine, network), declared| {
            let before = declared.len();
            declared.retain(|_, owner| *owner != *name);
            if declared.len() != before {
                touched.push(ports_key(machine, network));
            }
            !declared.is_empty()
        });
        if !touched.is_empty() {
            self.ports_watchers.notify(&touched);
        }
        if let Some(machine) = unit.machine {
            self.notify_units(&machine, name);
        }
        Ok(())
    }

    fn notify_units(&self, machine: &MachineId, unit: &UnitName) {
        if let Some(fanout) = self.unit_watchers.get(machine) {
            fanout.notify(&vec![unit.to_string()]);
        }
    }

    // ── Declared ports ───────────────────────────────────────────────

    /// Declare ranges for a unit on its machine's network.
    pub fn open_ports(
        &self,
        unit: &UnitName,
        network: impl Into<NetworkName>,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError> {
        let network = network.into();
        let machine = self.assigned_machine(unit)?;
        {
            let mut declared = self
                .ports
                .entry((machine.clone(), network.clone()))
                .or_default();
            if let Some((range, owner)) = ranges.iter().find_map(|range| {
                declared
                    .get(range)
                    .filter(|owner| *owner != unit)
                    .map(|owner| (range, owner))
            }) {
                return Err(FirewallError::PortConflict {
                    range: range.to_string(),
                    network: network.to_string(),
                    owner: owner.to_string(),
                });
            }
            for range in ranges {
                declared.insert(*range, unit.clone());
            }
        }
        self.ports_watchers
            .notify(&vec![ports_key(&machine, &network)]);
        Ok(())
    }

    /// Withdraw ranges a unit declared on its machine's network.
    pub fn close_ports(
        &self,
        unit: &UnitName,
        network: impl Into<NetworkName>,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError> {
        let network = network.into();
        let machine = self.assigned_machine(unit)?;
        let key = (machine.clone(), network.clone());
        if let Some(mut declared) = self.ports.get_mut(&key) {
            for range in ranges {
                if declared.get(range) == Some(unit) {
                    declared.remove(range);
                }
            }
        }
        self.ports.remove_if(&key, |_, declared| declared.is_empty());
        self.ports_watchers
            .notify(&vec![ports_key(&machine, &network)]);
        Ok(())
    }

    fn assigned_machine(&self, unit: &UnitName) -> Result<MachineId, FirewallError> {
        self.units
            .get(unit)
            .ok_or_else(|| FirewallError::not_found("unit", unit))?
            .machine
            .clone()
            .ok_or_else(|| FirewallError::NotAssigned {
                unit: unit.to_string(),
            })
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Live subscriptions to a machine's unit list.
    pub fn unit_watcher_count(&self, machine: &MachineId) -> usize {
        self.unit_watchers
            .get(machine)
            .map_or(0, |fanout| fanout.active())
    }

    /// Live subscriptions to a service.
    pub fn service_watcher_count(&self, service: &ServiceName) -> usize {
        self.service_watchers
            .get(service)
            .map_or(0, |fanout| fanout.active())
    }
}

fn ports_key(machine: &MachineId, network: &NetworkName) -> String {
    format!("{machine}:{network}")
}

#[async_trait]
impl StateSource for MemoryState {
    async fn watch_environ_config(&self) -> Result<NotifyWatcher, FirewallError> {
        Ok(self
            .environ_watchers
            .subscribe("environ config".into(), ()))
    }

    async fn environ_config(&self) -> Result<EnvironConfig, FirewallError> {
        Ok(self
            .environ_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn watch_machines(&self) -> Result<StringsWatcher, FirewallError> {
        let mut ids: Vec<String> = self.machines.iter().map(|m| m.key().to_string()).collect();
        ids.sort();
        Ok(self.machine_watchers.subscribe("machines".into(), ids))
    }

    async fn watch_opened_ports(&self) -> Result<StringsWatcher, FirewallError> {
        let mut keys: Vec<String> = self
            .ports
            .iter()
            .map(|entry| ports_key(&entry.key().0, &entry.key().1))
            .collect();
        keys.sort();
        Ok(self.ports_watchers.subscribe("opened ports".into(), keys))
    }

    async fn machine(&self, id: &MachineId) -> Result<MachineInfo, FirewallError> {
        let record = self
            .machines
            .get(id)
            .ok_or_else(|| FirewallError::not_found("machine", id))?;
        Ok(MachineInfo {
            id: id.clone(),
            life: record.life,
        })
    }

    async fn watch_units(&self, machine: &MachineId) -> Result<StringsWatcher, FirewallError> {
        if !self.machines.contains_key(machine) {
            return Err(FirewallError::not_found("machine", machine));
        }
        let mut names: Vec<String> = self
            .units
            .iter()
            .filter(|unit| unit.machine.as_ref() == Some(machine))
            .map(|unit| unit.key().to_string())
            .collect();
        names.sort();
        Ok(self
            .unit_watchers
            .entry(machine.clone())
            .or_default()
            .subscribe(format!("units of machine {machine}"), names))
    }

    async fn instance_id(&self, machine: &MachineId) -> Result<InstanceId, FirewallError> {
        self.machines
            .get(machine)
            .ok_or_else(|| FirewallError::not_found("machine", machine))?
            .instance
            .clone()
            .ok_or_else(|| FirewallError::NotProvisioned {
                machine: machine.to_string(),
            })
    }

    async fn active_networks(
        &self,
        machine: &MachineId,
    ) -> Result<Vec<NetworkName>, FirewallError> {
        if !self.machines.contains_key(machine) {
            return Err(FirewallError::not_found("machine", machine));
        }
        let mut networks: Vec<NetworkName> = self
            .ports
            .iter()
            .filter(|entry| entry.key().0 == *machine && !entry.value().is_empty())
            .map(|entry| entry.key().1.clone())
            .collect();
        networks.sort();
        Ok(networks)
    }

    async fn opened_ports(
        &self,
        machine: &MachineId,
        network: &NetworkName,
    ) -> Result<DeclaredPorts, FirewallError> {
        if !self.machines.contains_key(machine) {
            return Err(FirewallError::not_found("machine", machine));
        }
        Ok(self
            .ports
            .get(&(machine.clone(), network.clone()))
            .map(|declared| declared.value().clone())
            .unwrap_or_default())
    }

    async fn unit(&self, name: &UnitName) -> Result<UnitInfo, FirewallError> {
        let record = self
            .units
            .get(name)
            .ok_or_else(|| FirewallError::not_found("unit", name))?;
        Ok(UnitInfo {
            name: name.clone(),
            service: record.service.clone(),
            life: record.life,
            machine: record.machine.clone(),
        })
    }

    async fn service_exposed(&self, service: &ServiceName) -> Result<bool, FirewallError> {
        self.services
            .get(service)
            .map(|exposed| *exposed)
            .ok_or_else(|| FirewallError::not_found("service", service))
    }

    async fn watch_service(&self, service: &ServiceName) -> Result<NotifyWatcher, FirewallError> {
        if !self.services.contains_key(service) {
            return Err(FirewallError::not_found("service", service));
        }
        Ok(self
            .service_watchers
            .entry(service.clone())
            .or_default()
            .subscribe(format!("service {service}"), ()))
    }
}
