// ── In-memory provider ──
//
// Tracks open ranges per instance and for the environment, records every
// open/close call in order, and can fail a chosen operation once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::trace;

use crate::error::FirewallError;
use crate::model::{EnvironConfig, InstanceId, MachineId, PortRange};
use crate::state::{Environ, EnvironProvider, Instance};

/// Provider operations that can be made to fail.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Open,
    SetConfig,
    OpenPorts,
    ClosePorts,
    Ports,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortOp {
    Open,
    Close,
}

/// Where a port call landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortScope {
    Environment,
    Instance(InstanceId),
}

impl fmt::Display for PortScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => f.write_str("environment"),
            Self::Instance(id) => write!(f, "instance {id}"),
        }
    }
}

/// One recorded open or close call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCall {
    pub scope: PortScope,
    pub op: PortOp,
    pub ranges: Vec<PortRange>,
}

#[derive(Debug, Default)]
struct Tables {
    config: Option<EnvironConfig>,
    config_history: Vec<EnvironConfig>,
    instances: BTreeMap<InstanceId, BTreeSet<PortRange>>,
    environ: BTreeSet<PortRange>,
    calls: Vec<PortCall>,
    failures: Vec<Operation>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume a pending failure for `op`, if one was injected.
    fn check(&self, op: Operation) -> Result<(), FirewallError> {
        let mut tables = self.lock();
        match tables.failures.iter().position(|pending| *pending == op) {
            Some(index) => {
                tables.failures.remove(index);
                Err(FirewallError::provider(op.to_string(), "injected failure"))
            }
            None => Ok(()),
        }
    }
}

/// Provider handing out a single shared [`MemoryEnviron`].
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    environ: MemoryEnviron,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The environment this provider opens, for inspection.
    pub fn environ(&self) -> &MemoryEnviron {
        &self.environ
    }
}

#[async_trait]
impl EnvironProvider for MemoryProvider {
    async fn open(&self, config: EnvironConfig) -> Result<Arc<dyn Environ>, FirewallError> {
        self.environ.shared.check(Operation::Open)?;
        self.environ.shared.lock().config = Some(config);
        Ok(Arc::new(self.environ.clone()))
    }
}

/// In-memory environment. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryEnviron {
    shared: Arc<Shared>,
}

impl MemoryEnviron {
    /// Register an instance with no open ports.
    pub fn start_instance(&self, id: impl Into<InstanceId>) -> InstanceId {
        let id = id.into();
        self.shared.lock().instances.entry(id.clone()).or_default();
        id
    }

    /// Replace an instance's open ranges without recording a call.
    pub fn set_instance_ports(&self, id: &InstanceId, ranges: &[PortRange]) {
        self.shared
            .lock()
            .instances
            .insert(id.clone(), ranges.iter().copied().collect());
    }

    /// Replace the environment's open ranges without recording a call.
    pub fn set_environ_ports(&self, ranges: &[PortRange]) {
        self.shared.lock().environ = ranges.iter().copied().collect();
    }

    /// Fail the next call of `op` once.
    pub fn fail_next(&self, op: Operation) {
        self.shared.lock().failures.push(op);
    }

    pub fn instance_ports(&self, id: &InstanceId) -> Vec<PortRange> {
        self.shared
            .lock()
            .instances
            .get(id)
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_instance_ports(&self) -> BTreeMap<InstanceId, Vec<PortRange>> {
        self.shared
            .lock()
            .instances
            .iter()
            .map(|(id, ports)| (id.clone(), ports.iter().copied().collect()))
            .collect()
    }

    pub fn environ_ports(&self) -> Vec<PortRange> {
        self.shared.lock().environ.iter().copied().collect()
    }

    /// Every open/close call so far, oldest first.
    pub fn calls(&self) -> Vec<PortCall> {
        self.shared.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.shared.lock().calls.clear();
    }

    /// Configurations pushed through `set_config`, oldest first.
    pub fn config_history(&self) -> Vec<EnvironConfig> {
        self.shared.lock().config_history.clone()
    }

    fn record(&self, scope: PortScope, op: PortOp, ranges: &[PortRange]) {
        trace!(scope = %scope, op = %op, count = ranges.len(), "recorded port call");
        self.shared.lock().calls.push(PortCall {
            scope,
            op,
            ranges: ranges.to_vec(),
        });
    }
}

#[async_trait]
impl Environ for MemoryEnviron {
    fn config(&self) -> EnvironConfig {
        self.shared.lock().config.clone().unwrap_or_default()
    }

    async fn set_config(&self, config: EnvironConfig) -> Result<(), FirewallError> {
        self.shared.check(Operation::SetConfig)?;
        let mut tables = self.shared.lock();
        tables.config = Some(config.clone());
        tables.config_history.push(config);
        Ok(())
    }

    async fn instance(&self, id: &InstanceId) -> Result<Arc<dyn Instance>, FirewallError> {
        if !self.shared.lock().instances.contains_key(id) {
            return Err(FirewallError::NoInstances {
                instance: id.to_string(),
            });
        }
        Ok(Arc::new(MemoryInstance {
            id: id.clone(),
            environ: self.clone(),
        }))
    }

    async fn open_ports(&self, ranges: &[PortRange]) -> Result<(), FirewallError> {
        self.shared.check(Operation::OpenPorts)?;
        self.shared.lock().environ.extend(ranges.iter().copied());
        self.record(PortScope::Environment, PortOp::Open, ranges);
        Ok(())
    }

    async fn close_ports(&self, ranges: &[PortRange]) -> Result<(), FirewallError> {
        self.shared.check(Operation::ClosePorts)?;
        {
            let mut tables = self.shared.lock();
            for range in ranges {
                tables.environ.remove(range);
            }
        }
        self.record(PortScope::Environment, PortOp::Close, ranges);
        Ok(())
    }

    async fn ports(&self) -> Result<Vec<PortRange>, FirewallError> {
        self.shared.check(Operation::Ports)?;
        Ok(self.environ_ports())
    }
}

#[derive(Debug)]
struct MemoryInstance {
    id: InstanceId,
    environ: MemoryEnviron,
}

impl MemoryInstance {
    fn with_ports<R>(
        &self,
        f: impl FnOnce(&mut BTreeSet<PortRange>) -> R,
    ) -> Result<R, FirewallError> {
        let mut tables = self.environ.shared.lock();
        let ports = tables
            .instances
            .get_mut(&self.id)
            .ok_or_else(|| FirewallError::NoInstances {
                instance: self.id.to_string(),
            })?;
        Ok(f(ports))
    }
}

#[async_trait]
impl Instance for MemoryInstance {
    fn id(&self) -> InstanceId {
        self.id.clone()
    }

    async fn open_ports(
        &self,
        machine: &MachineId,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError> {
        self.environ.shared.check(Operation::OpenPorts)?;
        self.with_ports(|ports| ports.extend(ranges.iter().copied()))?;
        trace!(machine = %machine, instance = %self.id, "opened instance ports");
        self.environ
            .record(PortScope::Instance(self.id.clone()), PortOp::Open, ranges);
        Ok(())
    }

    async fn close_ports(
        &self,
        machine: &MachineId,
        ranges: &[PortRange],
    ) -> Result<(), FirewallError> {
        self.environ.shared.check(Operation::ClosePorts)?;
        self.with_ports(|ports| {
            for range in ranges {
                ports.remove(range);
            }
        })?;
        trace!(machine = %machine, instance = %self.id, "closed instance ports");
        self.environ
            .record(PortScope::Instance(self.id.clone()), PortOp::Close, ranges);
        Ok(())
    }

    async fn ports(&self, _machine: &MachineId) -> Result<Vec<PortRange>, FirewallError> {
        self.environ.shared.check(Operation::Ports)?;
        self.with_ports(|ports| ports.iter().copied().collect())
    }
}
