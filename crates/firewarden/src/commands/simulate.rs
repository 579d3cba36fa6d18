//! `firewarden simulate`: replay a scenario against the in-memory
//! collaborators and report what the provider ended up with.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use tabled::Tabled;
use tracing::{debug, info};

use firewarden_core::memory::{MemoryEnviron, PortCall, PortScope};
use firewarden_core::{FirewallMode, Firewaller, InstanceId, PortRange};

use crate::cli::{GlobalOpts, SimulateArgs};
use crate::config::Loaded;
use crate::error::CliError;
use crate::output;
use crate::scenario::Scenario;

// ── Report ───────────────────────────────────────────────────────────

/// Provider state after the run, plus every call the engine made.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub firewall_mode: FirewallMode,
    pub environment_ports: Vec<PortRange>,
    pub instance_ports: BTreeMap<InstanceId, Vec<PortRange>>,
    pub calls: Vec<PortCall>,
}

impl Report {
    fn collect(firewall_mode: FirewallMode, environ: &MemoryEnviron) -> Self {
        Self {
            firewall_mode,
            environment_ports: environ.environ_ports(),
            instance_ports: environ.all_instance_ports(),
            calls: environ.calls(),
        }
    }

    fn port_rows(&self) -> Vec<PortRow> {
        let environment = PortRow {
            scope: PortScope::Environment.to_string(),
            ports: join(&self.environment_ports),
        };
        std::iter::once(environment)
            .chain(self.instance_ports.iter().map(|(id, ranges)| PortRow {
                scope: PortScope::Instance(id.clone()).to_string(),
                ports: join(ranges),
            }))
            .collect()
    }

    fn call_rows(&self, color: bool) -> Vec<CallRow> {
        self.calls
            .iter()
            .enumerate()
            .map(|(index, call)| CallRow {
                seq: index + 1,
                op: output::paint_op(&call.op.to_string(), color),
                scope: call.scope.to_string(),
                ports: join(&call.ranges),
            })
            .collect()
    }
}

#[derive(Tabled)]
struct PortRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Open ports")]
    ports: String,
}

#[derive(Tabled)]
struct CallRow {
    #[tabled(rename = "#")]
    seq: usize,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Ports")]
    ports: String,
}

fn join(ranges: &[PortRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_table(report: &Report, calls: bool, color: bool) -> String {
    let mut out = output::render_table(&report.port_rows());
    if calls {
        if report.calls.is_empty() {
            out.push_str("\nNo provider calls.");
        } else {
            let _ = write!(out, "\n{}", output::render_table(&report.call_rows(color)));
        }
    }
    out
}

fn render_plain(report: &Report, calls: bool) -> String {
    let mut lines: Vec<String> = report
        .port_rows()
        .into_iter()
        .map(|row| format!("{}\t{}", row.scope, row.ports))
        .collect();
    if calls {
        lines.extend(
            report
                .call_rows(false)
                .into_iter()
                .map(|row| format!("{}\t{}\t{}\t{}", row.seq, row.op, row.scope, row.ports)),
        );
    }
    lines.join("\n")
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(
    args: &SimulateArgs,
    loaded: &Loaded,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let scenario = Scenario::load(&args.scenario)?;
    let environ_config = scenario.environ_config(args.mode);
    let firewall_mode = environ_config.firewall_mode;
    let world = scenario
        .build(environ_config)
        .map_err(|source| CliError::Setup { source })?;
    let quiet = Duration::from_millis(
        args.settle_ms
            .unwrap_or(loaded.config.simulation.settle_ms),
    );

    info!(
        scenario = %args.scenario.display(),
        mode = %firewall_mode,
        steps = scenario.steps.len(),
        "starting simulation"
    );
    let firewaller = Firewaller::start(
        world.state.clone(),
        world.provider.clone(),
        loaded.config.to_firewaller_config(),
    );
    settle(&firewaller, world.environ(), quiet).await;

    let mut outcome = Ok(());
    for (index, step) in scenario.steps.iter().enumerate() {
        if firewaller.dying().is_cancelled() {
            break;
        }
        debug!(step = index + 1, action = step.action(), "applying step");
        if let Err(source) = step.apply(&world).await {
            outcome = Err(CliError::Step {
                index: index + 1,
                action: step.action().to_owned(),
                source,
            });
            break;
        }
        settle(&firewaller, world.environ(), quiet).await;
    }

    let stopped = firewaller.stop().await;
    let report = Report::collect(firewall_mode, world.environ());
    let calls = !args.no_calls;
    let color = output::should_color(&global.color);
    let rendered = output::render(
        &global.output,
        &report,
        |r| render_table(r, calls, color),
        |r| render_plain(r, calls),
    )?;
    output::print_output(&rendered, global.quiet);

    stopped?;
    outcome
}

/// Wait until the provider has seen no new calls for one quiet period,
/// or the engine has stopped.
async fn settle(firewaller: &Firewaller, environ: &MemoryEnviron, quiet: Duration) {
    let dying = firewaller.dying();
    let mut seen = environ.calls().len();
    loop {
        tokio::select! {
            () = dying.cancelled() => return,
            () = tokio::time::sleep(quiet) => {}
        }
        let now = environ.calls().len();
        if now == seen {
            return;
        }
        seen = now;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use firewarden_core::memory::PortOp;

    use super::*;

    fn report() -> Report {
        let http: PortRange = "80/tcp".parse().unwrap();
        Report {
            firewall_mode: FirewallMode::Instance,
            environment_ports: Vec::new(),
            instance_ports: BTreeMap::from([(InstanceId::from("i-0"), vec![http])]),
            calls: vec![PortCall {
                scope: PortScope::Instance(InstanceId::from("i-0")),
                op: PortOp::Open,
                ranges: vec![http],
            }],
        }
    }

    #[test]
    fn plain_lists_tables_then_calls() {
        let plain = render_plain(&report(), true);
        assert_eq!(
            plain,
            "environment\t\ninstance i-0\t80/tcp\n1\topen\tinstance i-0\t80/tcp"
        );
        assert_eq!(
            render_plain(&report(), false),
            "environment\t\ninstance i-0\t80/tcp"
        );
    }

    #[test]
    fn table_includes_call_log() {
        let table = render_table(&report(), true, false);
        assert!(table.contains("Open ports"));
        assert!(table.contains("instance i-0"));
        assert!(table.contains("open"));
    }

    #[test]
    fn json_uses_kebab_keys() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["firewall-mode"], "instance");
        assert_eq!(json["instance-ports"]["i-0"][0], "80/tcp");
        assert_eq!(json["calls"][0]["op"], "open");
    }
}
