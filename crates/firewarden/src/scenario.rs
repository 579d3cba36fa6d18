//! Declared-state scenarios for `firewarden simulate`.
//!
//! A scenario seeds the in-memory state store and provider, then lists
//! steps that mutate the declared state one at a time:
//!
//! ```yaml
//! environment:
//!   name: demo
//!   firewall-mode: instance
//! machines:
//!   - id: "0"
//!     instance: i-0
//!     ports: ["22/tcp"]
//! services:
//!   - name: web
//! units:
//!   - name: web/0
//!     machine: "0"
//!     ports:
//!       default: ["80/tcp"]
//! steps:
//!   - action: expose
//!     service: web
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use firewarden_core::memory::{MemoryEnviron, MemoryProvider, MemoryState, Operation};
use firewarden_core::{
    EnvironConfig, FirewallError, FirewallMode, InstanceId, Life, MachineId, NetworkName,
    PortRange, ServiceName, StateSource, UnitName,
};

use crate::error::CliError;

const DEFAULT_NETWORK: &str = "default";

fn default_network() -> NetworkName {
    NetworkName::from(DEFAULT_NETWORK)
}

// ── Document ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub provider: ProviderSpec,
    #[serde(default)]
    pub machines: Vec<MachineSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub units: Vec<UnitSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EnvironmentSpec {
    #[serde(default = "default_environment_name")]
    pub name: String,
    #[serde(default)]
    pub firewall_mode: FirewallMode,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            firewall_mode: FirewallMode::default(),
            attributes: BTreeMap::new(),
        }
    }
}

fn default_environment_name() -> String {
    "simulation".into()
}

/// Provider-side state that exists before the engine starts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProviderSpec {
    #[serde(default)]
    pub environment_ports: Vec<PortRange>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MachineSpec {
    pub id: MachineId,
    /// Provider instance; absent while the machine is unprovisioned.
    #[serde(default)]
    pub instance: Option<InstanceId>,
    /// Ranges already open on the instance.
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub life: Life,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: ServiceName,
    #[serde(default)]
    pub exposed: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UnitSpec {
    pub name: UnitName,
    #[serde(default)]
    pub machine: Option<MachineId>,
    /// Declared ranges per network.
    #[serde(default)]
    pub ports: BTreeMap<NetworkName, Vec<PortRange>>,
}

/// One mutation of the declared state (or of the provider).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Step {
    Expose {
        service: ServiceName,
    },
    Unexpose {
        service: ServiceName,
    },
    AddService {
        service: ServiceName,
        #[serde(default)]
        exposed: bool,
    },
    RemoveService {
        service: ServiceName,
    },
    AddMachine {
        machine: MachineId,
        #[serde(default)]
        instance: Option<InstanceId>,
    },
    Provision {
        machine: MachineId,
        instance: InstanceId,
    },
    SetMachineLife {
        machine: MachineId,
        life: Life,
    },
    RemoveMachine {
        machine: MachineId,
    },
    AddUnit {
        unit: UnitName,
        #[serde(default)]
        machine: Option<MachineId>,
    },
    AssignUnit {
        unit: UnitName,
        machine: MachineId,
    },
    UnassignUnit {
        unit: UnitName,
    },
    SetUnitLife {
        unit: UnitName,
        life: Life,
    },
    RemoveUnit {
        unit: UnitName,
    },
    OpenPorts {
        unit: UnitName,
        #[serde(default = "default_network")]
        network: NetworkName,
        ports: Vec<PortRange>,
    },
    ClosePorts {
        unit: UnitName,
        #[serde(default = "default_network")]
        network: NetworkName,
        ports: Vec<PortRange>,
    },
    SetFirewallMode {
        mode: FirewallMode,
    },
    FailNext {
        operation: Operation,
    },
}

// ── Loading ──────────────────────────────────────────────────────────

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CliError::ScenarioNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                CliError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(&raw).map_err(|source| CliError::Scenario {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// The environment config the run starts with.
    pub fn environ_config(&self, mode: Option<FirewallMode>) -> EnvironConfig {
        EnvironConfig {
            name: self.environment.name.clone(),
            firewall_mode: mode.unwrap_or(self.environment.firewall_mode),
            attributes: self.environment.attributes.clone(),
        }
    }

    /// Seed the state store and provider with the scenario's initial state.
    pub fn build(&self, config: EnvironConfig) -> Result<World, FirewallError> {
        let world = World {
            state: Arc::new(MemoryState::new(config)),
            provider: Arc::new(MemoryProvider::new()),
        };
        let environ = world.environ();
        environ.set_environ_ports(&self.provider.environment_ports);

        for spec in &self.machines {
            let id = world.state.add_machine(spec.id.clone());
            match &spec.instance {
                Some(instance) => world.provision(&id, instance, &spec.ports)?,
                None if !spec.ports.is_empty() => {
                    return Err(FirewallError::InvalidConfig {
                        message: format!("machine {id} has provider ports but no instance"),
                    });
                }
                None => {}
            }
            if spec.life != Life::Alive {
                world.state.set_machine_life(&id, spec.life)?;
            }
        }

        for spec in &self.services {
            world.state.add_service(spec.name.clone(), spec.exposed);
        }

        for spec in &self.units {
            let unit = world.state.add_unit(spec.name.as_str())?;
            if let Some(machine) = &spec.machine {
                world.state.assign_unit(&unit, machine)?;
            }
            for (network, ranges) in &spec.ports {
                world.state.open_ports(&unit, network.clone(), ranges)?;
            }
        }

        Ok(world)
    }
}

// ── World ────────────────────────────────────────────────────────────

/// The in-memory collaborators a simulation runs against.
#[derive(Debug, Clone)]
pub struct World {
    pub state: Arc<MemoryState>,
    pub provider: Arc<MemoryProvider>,
}

impl World {
    pub fn environ(&self) -> &MemoryEnviron {
        self.provider.environ()
    }

    fn provision(
        &self,
        machine: &MachineId,
        instance: &InstanceId,
        ports: &[PortRange],
    ) -> Result<(), FirewallError> {
        let instance = self.environ().start_instance(instance.clone());
        self.environ().set_instance_ports(&instance, ports);
        self.state.set_instance_id(machine, instance)
    }
}

// ── Steps ────────────────────────────────────────────────────────────

impl Step {
    /// Kebab-case name of the action, as written in the scenario.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Expose { .. } => "expose",
            Self::Unexpose { .. } => "unexpose",
            Self::AddService { .. } => "add-service",
            Self::RemoveService { .. } => "remove-service",
            Self::AddMachine { .. } => "add-machine",
            Self::Provision { .. } => "provision",
            Self::SetMachineLife { .. } => "set-machine-life",
            Self::RemoveMachine { .. } => "remove-machine",
            Self::AddUnit { .. } => "add-unit",
            Self::AssignUnit { .. } => "assign-unit",
            Self::UnassignUnit { .. } => "unassign-unit",
            Self::SetUnitLife { .. } => "set-unit-life",
            Self::RemoveUnit { .. } => "remove-unit",
            Self::OpenPorts { .. } => "open-ports",
            Self::ClosePorts { .. } => "close-ports",
            Self::SetFirewallMode { .. } => "set-firewall-mode",
            Self::FailNext { .. } => "fail-next",
        }
    }

    pub async fn apply(&self, world: &World) -> Result<(), FirewallError> {
        let state = &world.state;
        match self {
            Self::Expose { service } => state.set_exposed(service, true),
            Self::Unexpose { service } => state.set_exposed(service, false),
            Self::AddService { service, exposed } => {
                state.add_service(service.clone(), *exposed);
                Ok(())
            }
            Self::RemoveService { service } => state.remove_service(service),
            Self::AddMachine { machine, instance } => {
                let id = state.add_machine(machine.clone());
                match instance {
                    Some(instance) => world.provision(&id, instance, &[]),
                    None => Ok(()),
                }
            }
            Self::Provision { machine, instance } => world.provision(machine, instance, &[]),
            Self::SetMachineLife { machine, life } => state.set_machine_life(machine, *life),
            Self::RemoveMachine { machine } => state.remove_machine(machine),
            Self::AddUnit { unit, machine } => {
                let unit = state.add_unit(unit.as_str())?;
                match machine {
                    Some(machine) => state.assign_unit(&unit, machine),
                    None => Ok(()),
                }
            }
            Self::AssignUnit { unit, machine } => state.assign_unit(unit, machine),
            Self::UnassignUnit { unit } => state.unassign_unit(unit),
            Self::SetUnitLife { unit, life } => state.set_unit_life(unit, *life),
            Self::RemoveUnit { unit } => state.remove_unit(unit),
            Self::OpenPorts {
                unit,
                network,
                ports,
            } => state.open_ports(unit, network.clone(), ports),
            Self::ClosePorts {
                unit,
                network,
                ports,
            } => state.close_ports(unit, network.clone(), ports),
            Self::SetFirewallMode { mode } => {
                let mut config = state.environ_config().await?;
                config.firewall_mode = *mode;
                state.set_environ_config(config);
                Ok(())
            }
            Self::FailNext { operation } => {
                world.environ().fail_next(*operation);
                Ok(())
            }
        }
    }
}
