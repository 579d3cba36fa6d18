// ── Port strategies ──
//
// Instance mode pushes a machine's port delta to that machine's instance.
// Global mode pushes to the environment, filtered through a reference count
// so a range stays open while any machine still wants it.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::FirewallError;
use crate::model::{MachineId, PortRange, sort_port_ranges};
use crate::state::{Environ, StateSource};

/// Whether a flush reached the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Applied,
    /// The machine has no instance to push to yet.
    Skipped,
}

/// Mode-specific way of applying a machine's port delta.
#[derive(Debug)]
pub(crate) enum PortStrategy {
    Instance,
    Global(GlobalPortRefs),
}

impl PortStrategy {
    pub(crate) async fn flush(
        &mut self,
        state: &dyn StateSource,
        environ: &dyn Environ,
        machine: &MachineId,
        to_open: &[PortRange],
        to_close: &[PortRange],
    ) -> Result<FlushOutcome, FirewallError> {
        if to_open.is_empty() && to_close.is_empty() {
            return Ok(FlushOutcome::Applied);
        }
        match self {
            Self::Instance => flush_instance(state, environ, machine, to_open, to_close).await,
            Self::Global(refs) => {
                let (open, close) = refs.apply(to_open, to_close);
                apply_environ(environ, &open, &close).await?;
                Ok(FlushOutcome::Applied)
            }
        }
    }
}

async fn flush_instance(
    state: &dyn StateSource,
    environ: &dyn Environ,
    machine: &MachineId,
    to_open: &[PortRange],
    to_close: &[PortRange],
) -> Result<FlushOutcome, FirewallError> {
    let instance_id = match state.instance_id(machine).await {
        Ok(id) => id,
        Err(err) if err.is_not_provisioned() || err.is_not_found() => {
            debug!(machine = %machine, error = %err, "no instance to flush ports to");
            return Ok(FlushOutcome::Skipped);
        }
        Err(err) => return Err(err),
    };
    let instance = environ.instance(&instance_id).await?;

    if !to_open.is_empty() {
        let mut ranges = to_open.to_vec();
        sort_port_ranges(&mut ranges);
        instance.open_ports(machine, &ranges).await?;
        info!(machine = %machine, ports = %render(&ranges), "opened port ranges on machine");
    }
    if !to_close.is_empty() {
        let mut ranges = to_close.to_vec();
        sort_port_ranges(&mut ranges);
        instance.close_ports(machine, &ranges).await?;
        info!(machine = %machine, ports = %render(&ranges), "closed port ranges on machine");
    }
    Ok(FlushOutcome::Applied)
}

/// Open then close ranges on the environment, skipping empty calls.
pub(crate) async fn apply_environ(
    environ: &dyn Environ,
    open: &[PortRange],
    close: &[PortRange],
) -> Result<(), FirewallError> {
    if !open.is_empty() {
        let mut ranges = open.to_vec();
        sort_port_ranges(&mut ranges);
        environ.open_ports(&ranges).await?;
        info!(ports = %render(&ranges), "opened port ranges in environment");
    }
    if !close.is_empty() {
        let mut ranges = close.to_vec();
        sort_port_ranges(&mut ranges);
        environ.close_ports(&ranges).await?;
        info!(ports = %render(&ranges), "closed port ranges in environment");
    }
    Ok(())
}

pub(crate) fn render(ranges: &[PortRange]) -> String {
    let parts: Vec<String> = ranges.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(" "))
}

// ── Global reference counts ─────────────────────────────────────────

/// How many machines currently want each environment-wide range open.
#[derive(Debug, Default)]
pub(crate) struct GlobalPortRefs {
    counts: BTreeMap<PortRange, u32>,
}

impl GlobalPortRefs {
    /// Account for a machine's delta and return the ranges whose count
    /// crossed 0→1 (to open) and 1→0 (to close).
    pub(crate) fn apply(
        &mut self,
        open: &[PortRange],
        close: &[PortRange],
    ) -> (Vec<PortRange>, Vec<PortRange>) {
        let mut opened = Vec::new();
        for range in open {
            let count = self.counts.entry(*range).or_insert(0);
            if *count == 0 {
                opened.push(*range);
            }
            *count += 1;
        }

        let mut closed = Vec::new();
        for range in close {
            match self.counts.get_mut(range) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.counts.remove(range);
                    closed.push(*range);
                }
                None => warn!(port = %range, "closing port range with no reference, ignoring"),
            }
        }
        (opened, closed)
    }

    #[cfg(test)]
    pub(crate) fn count(&self, range: &PortRange) -> u32 {
        self.counts.get(range).copied().unwrap_or(0)
    }
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
    fn opens_only_on_first_reference() {
        let mut refs = GlobalPortRefs::default();
        assert_eq!(refs.apply(&[tcp(80)], &[]), (vec![tcp(80)], vec![]));
        assert_eq!(refs.apply(&[tcp(80)], &[]), (vec![], vec![]));
        assert_eq!(refs.count(&tcp(80)), 2);
    }

    #[test]
    fn closes_only_on_last_reference() {
        let mut refs = GlobalPortRefs::default();
        refs.apply(&[tcp(80)], &[]);
        refs.apply(&[tcp(80)], &[]);
        assert_eq!(refs.apply(&[], &[tcp(80)]), (vec![], vec![]));
        assert_eq!(refs.count(&tcp(80)), 1);
        assert_eq!(refs.apply(&[], &[tcp(80)]), (vec![], vec![tcp(80)]));
        assert_eq!(refs.count(&tcp(80)), 0);
    }

    #[test]
    fn closing_unreferenced_range_saturates() {
        let mut refs = GlobalPortRefs::default();
        assert_eq!(refs.apply(&[], &[tcp(443)]), (vec![], vec![]));
        assert_eq!(refs.count(&tcp(443)), 0);
        // A later open still crosses 0→1.
        assert_eq!(refs.apply(&[tcp(443)], &[]), (vec![tcp(443)], vec![]));
    }

    #[test]
    fn render_lists_ranges() {
        let udp = PortRange::new(1000, 1010, Protocol::Udp).unwrap();
        assert_eq!(render(&[tcp(80), udp]), "[80/tcp 1000-1010/udp]");
    }
}
