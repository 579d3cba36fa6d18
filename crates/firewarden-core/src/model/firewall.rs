// ── Firewall domain types ──

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ModelError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// A contiguous interval of ports on one protocol.
///
/// The derived ordering (protocol, then low port, then high port) is the
/// normalized order applied-port sets are recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
}

impl PortRange {
    pub fn new(from_port: u16, to_port: u16, protocol: Protocol) -> Result<Self, ModelError> {
        let range = Self {
            protocol,
            from_port,
            to_port,
        };
        range.validate()?;
        Ok(range)
    }

    /// A range covering exactly one port.
    pub fn single(port: u16, protocol: Protocol) -> Result<Self, ModelError> {
        Self::new(port, port, protocol)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.from_port == 0 || self.from_port > self.to_port {
            return Err(ModelError::InvalidPortRange {
                range: self.to_string(),
                reason: "ports must satisfy 1 <= from <= to <= 65535".into(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.from_port..=self.to_port).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_port == self.to_port {
            write!(f, "{}/{}", self.from_port, self.protocol)
        } else {
            write!(f, "{}-{}/{}", self.from_port, self.to_port, self.protocol)
        }
    }
}

impl FromStr for PortRange {
    type Err = ModelError;

    /// Accepts `80`, `80/tcp`, `8000-8099/udp`. A missing protocol means tcp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ModelError::InvalidPortRange {
            range: s.to_owned(),
            reason: reason.to_owned(),
        };

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (
                ports,
                proto
                    .parse::<Protocol>()
                    .map_err(|_| invalid("unknown protocol"))?,
            ),
            None => (s, Protocol::Tcp),
        };

        let parse_port = |p: &str| p.trim().parse::<u16>().map_err(|_| invalid("bad port number"));
        let (from_port, to_port) = match ports.split_once('-') {
            Some((from, to)) => (parse_port(from)?, parse_port(to)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };

        Self::new(from_port, to_port, protocol)
    }
}

impl TryFrom<String> for PortRange {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

/// Sort port ranges into the normalized (protocol, from, to) order.
pub fn sort_port_ranges(ranges: &mut [PortRange]) {
    ranges.sort_unstable();
}

/// How the provider's firewall is driven.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FirewallMode {
    /// Ports are opened and closed on each machine's instance.
    #[default]
    Instance,
    /// Ports are shared by the whole environment and reference counted.
    Global,
    /// The engine does not manage the firewall at all.
    None,
}
