// ── Diff and key helpers ──

use std::collections::HashSet;

use crate::error::FirewallError;
use crate::model::{MachineId, NetworkName, PortRange};

/// Ranges in `a` that are not in `b`, in `a`'s order.
pub fn diff_ranges(a: &[PortRange], b: &[PortRange]) -> Vec<PortRange> {
    let exclude: HashSet<&PortRange> = b.iter().collect();
    let mut seen = HashSet::new();
    a.iter()
        .filter(|range| !exclude.contains(range) && seen.insert(**range))
        .copied()
        .collect()
}

/// Split a port-change key (`machine:network`) into its parts.
///
/// The network part may itself contain colons; only the first one splits.
pub fn parse_ports_key(key: &str) -> Result<(MachineId, NetworkName), FirewallError> {
    let invalid = |reason: &str| FirewallError::InvalidPortsKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };
    let (machine, network) = key
        .split_once(':')
        .ok_or_else(|| invalid("unexpected format, want machine:network"))?;
    if machine.is_empty() {
        return Err(invalid("empty machine id"));
    }
    if network.is_empty() {
        return Err(invalid("empty network name"));
    }
    Ok((MachineId::from(machine), NetworkName::from(network)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::Protocol;

    fn tcp(port: u16) -> PortRange {
        PortRange::single(port, Protocol::Tcp).unwrap()
    }

    #[test]
    fn diff_is_set_subtraction() {
        let a = [tcp(80), tcp(443), tcp(8080)];
        let b = [tcp(443), tcp(22)];
        assert_eq!(diff_ranges(&a, &b), vec![tcp(80), tcp(8080)]);
        assert_eq!(diff_ranges(&b, &a), vec![tcp(22)]);
    }

    #[test]
    fn diff_with_self_is_empty() {
        let a = [tcp(80), tcp(443)];
        assert!(diff_ranges(&a, &a).is_empty());
    }

    #[test]
    fn diff_ignores_order() {
        let a = [tcp(1), tcp(2), tcp(3)];
        let b = [tcp(3), tcp(1)];
        let reversed = [tcp(3), tcp(2), tcp(1)];
        assert_eq!(diff_ranges(&a, &b), diff_ranges(&reversed, &b));
    }

    #[test]
    fn diff_collapses_duplicates() {
        let a = [tcp(80), tcp(80)];
        assert_eq!(diff_ranges(&a, &[]), vec![tcp(80)]);
    }

    #[test]
    fn diff_distinguishes_protocols() {
        let udp = PortRange::single(53, Protocol::Udp).unwrap();
        assert_eq!(diff_ranges(&[udp], &[tcp(53)]), vec![udp]);
    }

    #[test]
    fn parses_machine_and_network() {
        let (machine, network) = parse_ports_key("0:juju-public").unwrap();
        assert_eq!(machine.as_str(), "0");
        assert_eq!(network.as_str(), "juju-public");
    }

    #[test]
    fn network_keeps_extra_colons() {
        let (machine, network) = parse_ports_key("4/lxd/2:net:a").unwrap();
        assert_eq!(machine.as_str(), "4/lxd/2");
        assert_eq!(network.as_str(), "net:a");
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "0", ":net", "0:"] {
            let err = parse_ports_key(key).unwrap_err();
            assert!(
                matches!(err, FirewallError::InvalidPortsKey { .. }),
                "{key:?} gave {err}"
            );
        }
    }
}
