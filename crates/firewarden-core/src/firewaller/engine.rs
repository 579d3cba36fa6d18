// ── Controller loop ──
//
// The engine is the only writer of tracker state. Every external change
// funnels into `run` and is applied in arrival order; machine and service
// forwarders feed it through bounded channels.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::FirewallerConfig;
use super::diff::{diff_ranges, parse_ports_key};
use super::strategy::{FlushOutcome, PortStrategy, apply_environ, render};
use super::tracker::{
    ExposedChange, MachineTracker, ServiceTracker, UnitTracker, UnitsChange, forward_exposed,
    forward_units,
};
use crate::error::{FirewallError, ResultExt};
use crate::model::{MachineId, NetworkName, PortRange, ServiceName, UnitInfo, UnitName};
use crate::state::{DeclaredPorts, Environ, NotifyWatcher, StateSource, StringsWatcher};
use crate::supervisor::Supervisor;

pub(crate) struct Engine {
    state: Arc<dyn StateSource>,
    environ: Arc<dyn Environ>,
    supervisor: Supervisor,
    dying: CancellationToken,
    strategy: PortStrategy,

    machines: HashMap<MachineId, MachineTracker>,
    units: HashMap<UnitName, UnitTracker>,
    services: HashMap<ServiceName, ServiceTracker>,

    /// Set once the one-time full reconciliation has run. Until then
    /// flushes only record what is wanted.
    reconciled: bool,
    next_generation: u64,
    units_tx: mpsc::Sender<UnitsChange>,
    exposed_tx: mpsc::Sender<ExposedChange>,
}

/// Change feeds the loop multiplexes.
pub(crate) struct Inputs {
    pub environ_config: NotifyWatcher,
    pub machines: StringsWatcher,
    pub ports: StringsWatcher,
    pub units: mpsc::Receiver<UnitsChange>,
    pub exposed: mpsc::Receiver<ExposedChange>,
}

impl Engine {
    pub(crate) fn new(
        state: Arc<dyn StateSource>,
        environ: Arc<dyn Environ>,
        supervisor: Supervisor,
        dying: CancellationToken,
        config: FirewallerConfig,
        strategy: PortStrategy,
    ) -> (Self, mpsc::Receiver<UnitsChange>, mpsc::Receiver<ExposedChange>) {
        let FirewallerConfig {
            units_channel_size,
            exposed_channel_size,
        } = config;
        let (units_tx, units_rx) = mpsc::channel(units_channel_size.max(1));
        let (exposed_tx, exposed_rx) = mpsc::channel(exposed_channel_size.max(1));
        let engine = Self {
            state,
            environ,
            supervisor,
            dying,
            strategy,
            machines: HashMap::new(),
            units: HashMap::new(),
            services: HashMap::new(),
            reconciled: false,
            next_generation: 0,
            units_tx,
            exposed_tx,
        };
        (engine, units_rx, exposed_rx)
    }

    // ── Main loop ────────────────────────────────────────────────────

    pub(crate) async fn run(mut self, mut inputs: Inputs) -> Result<(), FirewallError> {
        loop {
            tokio::select! {
                biased;
                () = self.dying.cancelled() => return Ok(()),
                change = inputs.environ_config.next() => {
                    if change.is_none() {
                        return Err(FirewallError::watcher_closed(inputs.environ_config.name()));
                    }
                    self.environ_config_changed().await?;
                }
                change = inputs.machines.next() => {
                    let Some(ids) = change else {
                        return Err(FirewallError::watcher_closed(inputs.machines.name()));
                    };
                    for id in ids {
                        self.machine_life_changed(MachineId::from(id)).await?;
                    }
                    if !self.reconciled {
                        self.reconcile().await?;
                    }
                }
                change = inputs.ports.next() => {
                    let Some(keys) = change else {
                        return Err(FirewallError::watcher_closed(inputs.ports.name()));
                    };
                    for key in keys {
                        let (machine, network) = parse_ports_key(&key)?;
                        self.opened_ports_changed(&machine, &network).await?;
                    }
                }
                Some(change) = inputs.units.recv() => self.forwarded_units_changed(change).await?,
                Some(change) = inputs.exposed.recv() => self.exposed_changed(change).await?,
            }
        }
    }

    async fn environ_config_changed(&mut self) -> Result<(), FirewallError> {
        let config = self.state.environ_config().await?;
        if let Err(err) = self.environ.set_config(config).await {
            error!(error = %err, "loaded invalid environment configuration");
        }
        Ok(())
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    // ── Machines ─────────────────────────────────────────────────────

    async fn machine_life_changed(&mut self, id: MachineId) -> Result<(), FirewallError> {
        let dead = match self.state.machine(&id).await {
            Ok(machine) => machine.life.is_dead(),
            Err(err) if err.is_not_found() => true,
            Err(err) => return Err(err),
        };
        let known = self.machines.contains_key(&id);
        if known && dead {
            self.forget_machine(&id).await?;
        } else if !known && !dead {
            self.start_machine(id).await?;
        }
        Ok(())
    }

    async fn start_machine(&mut self, id: MachineId) -> Result<(), FirewallError> {
        let mut watcher = match self.state.watch_units(&id).await {
            Ok(watcher) => watcher,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let initial = tokio::select! {
            biased;
            () = self.dying.cancelled() => return Ok(()),
            change = watcher.next() => match change {
                Some(units) => units,
                None => return Err(FirewallError::watcher_closed(watcher.name())),
            },
        };

        let generation = self.next_generation();
        debug!(machine = %id, "started watching machine");
        self.machines
            .insert(id.clone(), MachineTracker::new(id.clone(), generation));

        if let Err(err) = self.units_changed(&id, initial).await {
            self.discard_machine(&id);
            return Err(err.context(format!("cannot respond to units changes for machine {id}")));
        }

        let inbox = self.units_tx.clone();
        let forwarded = id.clone();
        let handle = self
            .supervisor
            .spawn(format!("machine {id} units"), move |stop| {
                forward_units(forwarded, generation, watcher, inbox, stop)
            });
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.watch = Some(handle);
        }
        Ok(())
    }

    async fn forget_machine(&mut self, id: &MachineId) -> Result<(), FirewallError> {
        let units: Vec<UnitName> = self
            .machines
            .get(id)
            .map(|machine| machine.units.iter().cloned().collect())
            .unwrap_or_default();
        for unit in &units {
            self.forget_unit(unit);
        }
        self.flush_machine(id).await?;
        // Dropping the tracker stops its forwarder.
        self.machines.remove(id);
        debug!(machine = %id, "stopped watching machine");
        Ok(())
    }

    /// Drop a machine whose registration failed, without touching the
    /// provider.
    fn discard_machine(&mut self, id: &MachineId) {
        let units: Vec<UnitName> = self
            .machines
            .get(id)
            .map(|machine| machine.units.iter().cloned().collect())
            .unwrap_or_default();
        for unit in &units {
            self.forget_unit(unit);
        }
        self.machines.remove(id);
    }

    // ── Units ────────────────────────────────────────────────────────

    async fn forwarded_units_changed(&mut self, change: UnitsChange) -> Result<(), FirewallError> {
        let current = self
            .machines
            .get(&change.machine)
            .is_some_and(|machine| machine.generation == change.generation);
        if !current {
            debug!(machine = %change.machine, "ignoring units change for stale machine");
            return Ok(());
        }
        self.units_changed(&change.machine, change.units).await
    }

    async fn units_changed(
        &mut self,
        machine: &MachineId,
        names: Vec<String>,
    ) -> Result<(), FirewallError> {
        let mut touched: BTreeSet<MachineId> = BTreeSet::new();

        for raw in names {
            let name = UnitName::parse(raw)?;
            let unit = match self.state.unit(&name).await {
                Ok(unit) => Some(unit),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            let assigned = unit.as_ref().and_then(|unit| unit.machine.clone());

            if let Some(known) = self.units.get(&name) {
                let gone = unit.as_ref().is_none_or(|unit| unit.life.is_dead());
                if gone || assigned.as_ref() != Some(&known.machine) {
                    touched.insert(known.machine.clone());
                    self.forget_unit(&name);
                }
            } else if let (Some(unit), Some(target)) = (unit, assigned) {
                if unit.life.is_dead() {
                    continue;
                }
                if !self.machines.contains_key(&target) {
                    debug!(unit = %name, machine = %target, "unit assigned to unknown machine, deferring");
                    continue;
                }
                self.start_unit(unit, &target).await?;
                touched.insert(target);
            }
        }

        debug!(machine = %machine, changed = touched.len(), "applied units change");
        for id in &touched {
            self.flush_machine(id).await?;
        }
        Ok(())
    }

    async fn start_unit(&mut self, unit: UnitInfo, machine: &MachineId) -> Result<(), FirewallError> {
        let UnitInfo { name, service, .. } = unit;

        self.units.insert(
            name.clone(),
            UnitTracker {
                name: name.clone(),
                machine: machine.clone(),
                service: service.clone(),
            },
        );
        if let Some(tracker) = self.machines.get_mut(machine) {
            tracker.units.insert(name.clone());
        }
        if !self.services.contains_key(&service) {
            self.start_service(&service).await?;
        }
        if let Some(tracker) = self.services.get_mut(&service) {
            tracker.units.insert(name.clone());
        }
        debug!(unit = %name, machine = %machine, "started watching unit");

        let networks = match self.state.active_networks(machine).await {
            Ok(networks) => networks,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        for network in &networks {
            self.opened_ports_changed(machine, network).await?;
        }
        Ok(())
    }

    fn forget_unit(&mut self, name: &UnitName) {
        let Some(unit) = self.units.remove(name) else {
            return;
        };
        if let Some(machine) = self.machines.get_mut(&unit.machine) {
            machine.units.remove(name);
        }
        let last = match self.services.get_mut(&unit.service) {
            Some(service) => {
                service.units.remove(name);
                service.units.is_empty()
            }
            None => false,
        };
        if last {
            // Dropping the tracker stops its forwarder.
            self.services.remove(&unit.service);
            debug!(service = %unit.service, "stopped watching service");
        }
        debug!(unit = %unit.name, "stopped watching unit");
    }

    // ── Services ─────────────────────────────────────────────────────

    async fn start_service(&mut self, name: &ServiceName) -> Result<(), FirewallError> {
        let exposed = self
            .state
            .service_exposed(name)
            .await
            .context(|| format!("cannot read exposure of service {name}"))?;
        let watcher = self.state.watch_service(name).await?;
        let generation = self.next_generation();

        let state = Arc::clone(&self.state);
        let inbox = self.exposed_tx.clone();
        let forwarded = name.clone();
        let watch = self
            .supervisor
            .spawn(format!("service {name} exposure"), move |stop| {
                forward_exposed(state, forwarded, generation, exposed, watcher, inbox, stop)
            });

        self.services.insert(
            name.clone(),
            ServiceTracker {
                name: name.clone(),
                generation,
                exposed,
                units: BTreeSet::new(),
                watch,
            },
        );
        debug!(service = %name, exposed, "started watching service");
        Ok(())
    }

    async fn exposed_changed(&mut self, change: ExposedChange) -> Result<(), FirewallError> {
        let Some(service) = self.services.get_mut(&change.service) else {
            return Ok(());
        };
        if service.generation != change.generation {
            debug!(service = %change.service, "ignoring exposure change for stale service");
            return Ok(());
        }
        service.exposed = change.exposed;
        info!(service = %service.name, exposed = change.exposed, "service exposure changed");

        let machines: BTreeSet<MachineId> = service
            .units
            .iter()
            .filter_map(|unit| self.units.get(unit))
            .map(|unit| unit.machine.clone())
            .collect();
        for machine in &machines {
            self.flush_machine(machine).await?;
        }
        Ok(())
    }

    // ── Declared ports ───────────────────────────────────────────────

    async fn opened_ports_changed(
        &mut self,
        machine: &MachineId,
        network: &NetworkName,
    ) -> Result<(), FirewallError> {
        let Some(tracker) = self.machines.get(machine) else {
            warn!(machine = %machine, network = %network, "port change for unknown machine, skipping");
            return Ok(());
        };
        let declared = match self.state.opened_ports(machine, network).await {
            Ok(declared) => declared,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        // Ports can be declared while their unit is still registering; the
        // unit's registration replays this change.
        if let Some(unit) = declared.values().find(|unit| !tracker.units.contains(*unit)) {
            debug!(machine = %machine, unit = %unit, "port change for unknown unit, skipping");
            return Ok(());
        }

        let previous = tracker.defined_ports.get(network);
        let unchanged = match previous {
            Some(previous) => *previous == declared,
            None => declared.is_empty(),
        };
        if unchanged {
            return Ok(());
        }

        if let Some(tracker) = self.machines.get_mut(machine) {
            if declared.is_empty() {
                tracker.defined_ports.remove(network);
            } else {
                tracker.defined_ports.insert(network.clone(), declared);
            }
        }
        self.flush_machine(machine).await
    }

    // ── Flushing ─────────────────────────────────────────────────────

    /// Ranges the machine should have open: declared by a unit on the
    /// machine whose service is exposed. Sorted.
    fn wanted_ports(&self, machine: &MachineTracker) -> Vec<PortRange> {
        let mut want = BTreeSet::new();
        for declared in machine.defined_ports.values() {
            want.extend(wanted_from(declared, machine, &self.units, &self.services));
        }
        want.into_iter().collect()
    }

    async fn flush_machine(&mut self, id: &MachineId) -> Result<(), FirewallError> {
        let Some(machine) = self.machines.get(id) else {
            return Ok(());
        };
        let want = self.wanted_ports(machine);
        let to_open = diff_ranges(&want, &machine.applied);
        let to_close = diff_ranges(&machine.applied, &want);
        if to_open.is_empty() && to_close.is_empty() {
            return Ok(());
        }
        if !self.reconciled {
            // Instance machines learn their applied set from the provider
            // during reconciliation. Global refcounts are built here and
            // the pass only has to diff the environment.
            if let PortStrategy::Global(refs) = &mut self.strategy {
                refs.apply(&to_open, &to_close);
                if let Some(machine) = self.machines.get_mut(id) {
                    machine.applied = want;
                }
            }
            return Ok(());
        }
        debug!(
            machine = %machine.id,
            open = %render(&to_open),
            close = %render(&to_close),
            "flushing machine ports"
        );

        let outcome = self
            .strategy
            .flush(&*self.state, &*self.environ, id, &to_open, &to_close)
            .await?;
        if outcome == FlushOutcome::Applied {
            if let Some(machine) = self.machines.get_mut(id) {
                machine.applied = want;
            }
        }
        Ok(())
    }

    // ── Full reconciliation ──────────────────────────────────────────

    async fn reconcile(&mut self) -> Result<(), FirewallError> {
        self.reconciled = true;
        match self.strategy {
            PortStrategy::Instance => self.reconcile_instances().await,
            PortStrategy::Global(_) => self.reconcile_global().await,
        }
    }

    async fn reconcile_instances(&mut self) -> Result<(), FirewallError> {
        let mut ids: Vec<MachineId> = self.machines.keys().cloned().collect();
        ids.sort();

        for id in ids {
            if let Err(err) = self.state.machine(&id).await {
                if err.is_not_found() {
                    self.forget_machine(&id).await?;
                    continue;
                }
                return Err(err);
            }
            let instance_id = match self.state.instance_id(&id).await {
                Ok(instance_id) => instance_id,
                Err(err) if err.is_not_provisioned() => {
                    warn!(machine = %id, "machine not yet provisioned, skipping reconcile");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let instance = match self.environ.instance(&instance_id).await {
                Ok(instance) => instance,
                Err(err) if err.is_no_instances() => {
                    warn!(machine = %id, error = %err, "instance not found, skipping reconcile");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let actual = instance.ports(&id).await?;
            let Some(machine) = self.machines.get(&id) else {
                continue;
            };
            let want = self.wanted_ports(machine);
            let to_open = diff_ranges(&want, &actual);
            let to_close = diff_ranges(&actual, &want);

            if !to_open.is_empty() {
                info!(machine = %id, ports = %render(&to_open), "opening instance ports");
                instance.open_ports(&id, &to_open).await?;
            }
            if !to_close.is_empty() {
                info!(machine = %id, ports = %render(&to_close), "closing instance ports");
                instance.close_ports(&id, &to_close).await?;
            }
            if let Some(machine) = self.machines.get_mut(&id) {
                machine.applied = want;
            }
        }
        Ok(())
    }

    async fn reconcile_global(&mut self) -> Result<(), FirewallError> {
        let actual = self.environ.ports().await?;

        let wanted: Vec<PortRange> = self
            .machines
            .values()
            .flat_map(|machine| self.wanted_ports(machine))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let to_open = diff_ranges(&wanted, &actual);
        let to_close = diff_ranges(&actual, &wanted);
        apply_environ(&*self.environ, &to_open, &to_close).await
    }
}

fn wanted_from(
    declared: &DeclaredPorts,
    machine: &MachineTracker,
    units: &HashMap<UnitName, UnitTracker>,
    services: &HashMap<ServiceName, ServiceTracker>,
) -> Vec<PortRange> {
    declared
        .iter()
        .filter(|(_, owner)| machine.units.contains(*owner))
        .filter(|(_, owner)| {
            units
                .get(*owner)
                .and_then(|unit| services.get(&unit.service))
                .is_some_and(|service| service.exposed)
        })
        .map(|(range, _)| *range)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::firewaller::strategy::GlobalPortRefs;
    use crate::memory::{MemoryEnviron, MemoryState, Operation, PortCall, PortOp, PortScope};
    use crate::model::{EnvironConfig, FirewallMode, InstanceId, Life, Protocol};

    struct Fixture {
        state: Arc<MemoryState>,
        environ: MemoryEnviron,
        supervisor: Supervisor,
        _units: mpsc::Receiver<UnitsChange>,
        _exposed: mpsc::Receiver<ExposedChange>,
    }

    fn fixture(mode: FirewallMode) -> (Engine, Fixture) {
        let state = Arc::new(MemoryState::new(EnvironConfig::new("test", mode)));
        let environ = MemoryEnviron::default();
        let supervisor = Supervisor::new();
        let strategy = match mode {
            FirewallMode::Global => PortStrategy::Global(GlobalPortRefs::default()),
            _ => PortStrategy::Instance,
        };
        let (engine, units, exposed) = Engine::new(
            state.clone(),
            Arc::new(environ.clone()),
            supervisor.clone(),
            supervisor.dying(),
            FirewallerConfig::default(),
            strategy,
        );
        let fixture = Fixture {
            state,
            environ,
            supervisor,
            _units: units,
            _exposed: exposed,
        };
        (engine, fixture)
    }

    impl Fixture {
        fn provisioned_machine(&self, id: &str, instance: &str) -> MachineId {
            let machine = self.state.add_machine(id);
            self.state.set_instance_id(&machine, instance).unwrap();
            self.environ.start_instance(instance);
            machine
        }

        fn deploy(&self, unit: &str, machine: &MachineId, ports: &[PortRange]) -> UnitName {
            let unit = self.state.add_unit(unit).unwrap();
            self.state.assign_unit(&unit, machine).unwrap();
            if !ports.is_empty() {
                self.state.open_ports(&unit, "public", ports).unwrap();
            }
            unit
        }

        async fn shutdown(self) {
            self.supervisor.kill(None);
            self.supervisor.wait().await.unwrap();
        }
    }

    fn tcp(port: u16) -> PortRange {
        PortRange::single(port, Protocol::Tcp).unwrap()
    }

    fn exposure(engine: &Engine, service: &ServiceName, exposed: bool) -> ExposedChange {
        ExposedChange {
            service: service.clone(),
            generation: engine.services[service].generation,
            exposed,
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn second_flush_makes_no_provider_calls() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        fx.state.add_service("wordpress", true);
        fx.deploy("wordpress/0", &m0, &[tcp(80)]);
        engine.reconciled = true;

        engine.machine_life_changed(m0.clone()).await.unwrap();
        assert_eq!(fx.environ.calls().len(), 1);

        engine.flush_machine(&m0).await.unwrap();
        engine.flush_machine(&m0).await.unwrap();
        assert_eq!(fx.environ.calls().len(), 1);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn cold_start_opens_missing_and_closes_stale() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        let instance = InstanceId::from("i-0");
        fx.environ.set_instance_ports(&instance, &[tcp(22), tcp(80)]);
        fx.state.add_service("wordpress", true);
        fx.deploy("wordpress/0", &m0, &[tcp(80), tcp(443)]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        assert!(fx.environ.calls().is_empty(), "flushes wait for reconcile");

        engine.reconcile().await.unwrap();
        assert_eq!(
            fx.environ.calls(),
            vec![
                PortCall {
                    scope: PortScope::Instance(instance.clone()),
                    op: PortOp::Open,
                    ranges: vec![tcp(443)],
                },
                PortCall {
                    scope: PortScope::Instance(instance.clone()),
                    op: PortOp::Close,
                    ranges: vec![tcp(22)],
                },
            ]
        );
        assert_eq!(fx.environ.instance_ports(&instance), vec![tcp(80), tcp(443)]);
        assert_eq!(engine.machines[&m0].applied, vec![tcp(80), tcp(443)]);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_skips_unprovisioned_machines() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.state.add_machine("0");
        fx.state.add_service("wordpress", true);
        fx.deploy("wordpress/0", &m0, &[tcp(80)]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.reconcile().await.unwrap();
        assert!(fx.environ.calls().is_empty());
        assert!(engine.machines[&m0].applied.is_empty());

        // Later flushes are no-ops too until the machine has an instance.
        engine.flush_machine(&m0).await.unwrap();
        assert!(fx.environ.calls().is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn exposing_service_opens_port_on_instance() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        let wordpress = fx.state.add_service("wordpress", false);
        fx.deploy("wordpress/0", &m0, &[tcp(80)]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.reconcile().await.unwrap();
        assert!(fx.environ.calls().is_empty());

        let change = exposure(&engine, &wordpress, true);
        engine.exposed_changed(change).await.unwrap();
        assert_eq!(
            fx.environ.calls(),
            vec![PortCall {
                scope: PortScope::Instance(InstanceId::from("i-0")),
                op: PortOp::Open,
                ranges: vec![tcp(80)],
            }]
        );
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn global_refcount_keeps_shared_port_open() {
        let (mut engine, fx) = fixture(FirewallMode::Global);
        let m0 = fx.state.add_machine("0");
        let m1 = fx.state.add_machine("1");
        let web = fx.state.add_service("web", false);
        let api = fx.state.add_service("api", false);
        fx.deploy("web/0", &m0, &[tcp(80)]);
        fx.deploy("api/0", &m1, &[tcp(80)]);

        engine.machine_life_changed(m0).await.unwrap();
        engine.machine_life_changed(m1).await.unwrap();
        engine.reconcile().await.unwrap();
        assert!(fx.environ.calls().is_empty());

        let open = PortCall {
            scope: PortScope::Environment,
            op: PortOp::Open,
            ranges: vec![tcp(80)],
        };
        let close = PortCall {
            scope: PortScope::Environment,
            op: PortOp::Close,
            ranges: vec![tcp(80)],
        };

        engine.exposed_changed(exposure(&engine, &web, true)).await.unwrap();
        engine.exposed_changed(exposure(&engine, &api, true)).await.unwrap();
        assert_eq!(fx.environ.calls(), vec![open.clone()]);

        engine.exposed_changed(exposure(&engine, &web, false)).await.unwrap();
        assert_eq!(fx.environ.calls(), vec![open.clone()]);
        assert_eq!(fx.environ.environ_ports(), vec![tcp(80)]);

        engine.exposed_changed(exposure(&engine, &api, false)).await.unwrap();
        assert_eq!(fx.environ.calls(), vec![open, close]);
        assert!(fx.environ.environ_ports().is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn global_cold_start_diffs_environment() {
        let (mut engine, fx) = fixture(FirewallMode::Global);
        fx.environ.set_environ_ports(&[tcp(22), tcp(80)]);
        let m0 = fx.state.add_machine("0");
        fx.state.add_service("web", true);
        fx.deploy("web/0", &m0, &[tcp(80), tcp(443)]);

        engine.machine_life_changed(m0).await.unwrap();
        engine.reconcile().await.unwrap();
        assert_eq!(fx.environ.environ_ports(), vec![tcp(80), tcp(443)]);
        assert_eq!(fx.environ.calls().len(), 2);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn global_cold_start_counts_registered_machines() {
        let (mut engine, fx) = fixture(FirewallMode::Global);
        let m0 = fx.state.add_machine("0");
        let m1 = fx.state.add_machine("1");
        let web = fx.state.add_service("web", true);
        fx.deploy("web/0", &m0, &[tcp(80)]);
        fx.deploy("web/1", &m1, &[tcp(80)]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.machine_life_changed(m1).await.unwrap();
        assert!(fx.environ.calls().is_empty(), "flushes wait for reconcile");
        assert_eq!(engine.machines[&m0].applied, vec![tcp(80)]);

        let open = PortCall {
            scope: PortScope::Environment,
            op: PortOp::Open,
            ranges: vec![tcp(80)],
        };
        engine.reconcile().await.unwrap();
        assert_eq!(fx.environ.calls(), vec![open.clone()]);

        // Both machines counted, so the range closes once, on unexpose.
        engine.exposed_changed(exposure(&engine, &web, false)).await.unwrap();
        assert_eq!(
            fx.environ.calls(),
            vec![
                open,
                PortCall {
                    scope: PortScope::Environment,
                    op: PortOp::Close,
                    ranges: vec![tcp(80)],
                },
            ]
        );
        assert!(fx.environ.environ_ports().is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn global_cold_start_keeps_already_open_ranges_counted() {
        let (mut engine, fx) = fixture(FirewallMode::Global);
        fx.environ.set_environ_ports(&[tcp(80)]);
        let m0 = fx.state.add_machine("0");
        fx.state.add_service("web", true);
        let unit = fx.deploy("web/0", &m0, &[tcp(80)]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.reconcile().await.unwrap();
        assert!(fx.environ.calls().is_empty());
        assert_eq!(engine.machines[&m0].applied, vec![tcp(80)]);

        // Withdrawing the declaration closes the range too.
        fx.state.close_ports(&unit, "public", &[tcp(80)]).unwrap();
        engine
            .opened_ports_changed(&m0, &NetworkName::from("public"))
            .await
            .unwrap();
        assert_eq!(
            fx.environ.calls(),
            vec![PortCall {
                scope: PortScope::Environment,
                op: PortOp::Close,
                ranges: vec![tcp(80)],
            }]
        );
        assert!(engine.machines[&m0].applied.is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn forgetting_machine_cascades_to_units_and_services() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.state.add_machine("0");
        let m1 = fx.state.add_machine("1");
        let wordpress = fx.state.add_service("wordpress", false);
        let mysql = fx.state.add_service("mysql", false);
        fx.deploy("wordpress/0", &m0, &[]);
        fx.deploy("mysql/0", &m0, &[]);
        let survivor = fx.deploy("mysql/1", &m1, &[]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.machine_life_changed(m1.clone()).await.unwrap();
        assert_eq!(engine.units.len(), 3);
        assert_eq!(fx.state.service_watcher_count(&wordpress), 1);

        fx.state.set_machine_life(&m0, Life::Dead).unwrap();
        engine.machine_life_changed(m0.clone()).await.unwrap();

        assert!(!engine.machines.contains_key(&m0));
        assert_eq!(engine.units.keys().cloned().collect::<Vec<_>>(), vec![survivor]);
        assert!(!engine.services.contains_key(&wordpress));
        assert!(engine.services.contains_key(&mysql));
        assert_eq!(engine.services[&mysql].units.len(), 1);

        let state = Arc::clone(&fx.state);
        eventually("service watch to stop", || {
            state.service_watcher_count(&wordpress) == 0
        })
        .await;
        eventually("machine watch to stop", || state.unit_watcher_count(&m0) == 0).await;
        assert_eq!(fx.state.service_watcher_count(&mysql), 1);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn unit_on_unknown_machine_is_deferred() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.state.add_machine("0");
        let m1 = fx.state.add_machine("1");
        fx.state.add_service("wordpress", false);
        let unit = fx.deploy("wordpress/0", &m1, &[]);

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine
            .units_changed(&m0, vec![unit.to_string()])
            .await
            .unwrap();
        assert!(engine.units.is_empty());

        engine.machine_life_changed(m1.clone()).await.unwrap();
        assert_eq!(engine.units[&unit].machine, m1);
        assert!(engine.machines[&m1].units.contains(&unit));
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn moved_unit_is_forgotten_and_its_ports_closed() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        let m1 = fx.provisioned_machine("1", "i-1");
        fx.state.add_service("wordpress", true);
        let unit = fx.deploy("wordpress/0", &m0, &[tcp(80)]);
        engine.reconciled = true;

        engine.machine_life_changed(m0.clone()).await.unwrap();
        engine.machine_life_changed(m1.clone()).await.unwrap();
        assert_eq!(fx.environ.instance_ports(&InstanceId::from("i-0")), vec![tcp(80)]);

        fx.state.assign_unit(&unit, &m1).unwrap();
        engine
            .units_changed(&m0, vec![unit.to_string()])
            .await
            .unwrap();
        assert!(fx.environ.instance_ports(&InstanceId::from("i-0")).is_empty());
        assert!(!engine.units.contains_key(&unit));

        engine
            .units_changed(&m1, vec![unit.to_string()])
            .await
            .unwrap();
        assert_eq!(engine.units[&unit].machine, m1);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn stale_exposure_change_is_ignored() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        let wordpress = fx.state.add_service("wordpress", false);
        fx.deploy("wordpress/0", &m0, &[tcp(80)]);
        engine.reconciled = true;
        engine.machine_life_changed(m0).await.unwrap();

        let mut change = exposure(&engine, &wordpress, true);
        change.generation += 1;
        engine.exposed_changed(change).await.unwrap();
        assert!(!engine.services[&wordpress].exposed);
        assert!(fx.environ.calls().is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn port_change_for_unknown_machine_is_skipped() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        engine.reconciled = true;
        engine
            .opened_ports_changed(&MachineId::from("7"), &NetworkName::from("public"))
            .await
            .unwrap();
        assert!(engine.machines.is_empty());
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn failed_registration_leaves_nothing_behind() {
        let (mut engine, fx) = fixture(FirewallMode::Instance);
        let m0 = fx.provisioned_machine("0", "i-0");
        fx.state.add_service("wordpress", true);
        fx.deploy("wordpress/0", &m0, &[tcp(80)]);
        fx.environ.fail_next(Operation::OpenPorts);
        engine.reconciled = true;

        let err = engine.machine_life_changed(m0.clone()).await.unwrap_err();
        assert!(matches!(err.root(), FirewallError::Provider { .. }), "{err}");
        assert!(engine.machines.is_empty());
        assert!(engine.units.is_empty());
        assert!(engine.services.is_empty());
        fx.shutdown().await;
    }
}
