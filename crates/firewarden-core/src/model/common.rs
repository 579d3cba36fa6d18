// ── Common types shared across the domain model ──

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::entity_id::{MachineId, ServiceName, UnitName};
use super::firewall::FirewallMode;

/// Lifecycle stage of a machine or unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// Point-in-time view of a machine as reported by the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub life: Life,
}

/// Point-in-time view of a unit as reported by the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub name: UnitName,
    pub service: ServiceName,
    pub life: Life,
    /// The machine the unit is assigned to; `None` while unassigned.
    pub machine: Option<MachineId>,
}

/// Environment configuration the provider is opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironConfig {
    pub name: String,
    #[serde(default)]
    pub firewall_mode: FirewallMode,
    /// Provider-specific settings, passed through opaquely.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl EnvironConfig {
    pub fn new(name: impl Into<String>, firewall_mode: FirewallMode) -> Self {
        Self {
            name: name.into(),
            firewall_mode,
            attributes: BTreeMap::new(),
        }
    }
}
