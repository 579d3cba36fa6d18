// ── Core identity types ──
//
// Machines, units, services, networks and provider instances are all
// addressed by stable string identifiers. Cross-references between
// trackers are lookups by these ids, never pointers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a provisioned compute node (e.g. `"0"`, `"4/lxd/2"`).
    MachineId
);

string_id!(
    /// Name of an application that owns units (e.g. `"wordpress"`).
    ServiceName
);

string_id!(
    /// Name of a network a machine's ports are declared on.
    NetworkName
);

string_id!(
    /// Provider-side identifier of the instance backing a machine.
    InstanceId
);

// ── UnitName ────────────────────────────────────────────────────────

/// Name of a deployed unit, always of the form `service/N`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName(String);

impl UnitName {
    /// Validate and wrap a unit name.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        let valid = raw.split_once('/').is_some_and(|(service, number)| {
            !service.is_empty()
                && !number.is_empty()
                && number.bytes().all(|b| b.is_ascii_digit())
        });
        if valid {
            Ok(Self(raw))
        } else {
            Err(ModelError::InvalidUnitName { name: raw })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The service this unit belongs to, derived from the name prefix.
    pub fn service(&self) -> ServiceName {
        let (service, _) = self.0.split_once('/').unwrap_or((self.0.as_str(), ""));
        ServiceName::from(service)
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UnitName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UnitName {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<UnitName> for String {
    fn from(name: UnitName) -> Self {
        name.0
    }
}
