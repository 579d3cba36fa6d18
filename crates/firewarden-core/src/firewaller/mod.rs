//! The firewaller: keeps provider firewall rules in line with the ports
//! that exposed services declare.
//!
//! [`Firewaller::start`] spawns the controller loop under a fresh
//! [`Supervisor`]. The loop waits for a usable environment configuration,
//! picks a port strategy from its firewall mode, registers machines as they
//! appear and runs one full reconciliation after the first machine snapshot.
//! Any unrecoverable error tears the whole tree down and is reported by
//! [`Firewaller::wait`].

mod diff;
mod engine;
mod strategy;
mod tracker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use diff::{diff_ranges, parse_ports_key};

use self::engine::{Engine, Inputs};
use self::strategy::{GlobalPortRefs, PortStrategy};
use crate::error::FirewallError;
use crate::model::FirewallMode;
use crate::state::{Environ, EnvironProvider, NotifyWatcher, StateSource};
use crate::supervisor::Supervisor;

/// Tuning for the controller loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallerConfig {
    /// Capacity of the channel machine forwarders deliver unit changes on.
    pub units_channel_size: usize,
    /// Capacity of the channel service forwarders deliver exposure flips on.
    pub exposed_channel_size: usize,
}

impl Default for FirewallerConfig {
    fn default() -> Self {
        Self {
            units_channel_size: 64,
            exposed_channel_size: 64,
        }
    }
}

/// Handle to a running firewaller.
#[derive(Debug, Clone)]
pub struct Firewaller {
    supervisor: Supervisor,
}

impl Firewaller {
    /// Start the engine. Must be called from within a tokio runtime.
    pub fn start(
        state: Arc<dyn StateSource>,
        provider: Arc<dyn EnvironProvider>,
        config: FirewallerConfig,
    ) -> Self {
        let supervisor = Supervisor::new();
        let tree = supervisor.clone();
        supervisor.spawn("firewaller", move |dying| async move {
            let result = run(state, provider, config, tree.clone(), dying).await;
            // The loop is the tree's reason to exist; its forwarders go too.
            tree.kill(None);
            result
        });
        Self { supervisor }
    }

    /// Request shutdown. Returns immediately.
    pub fn kill(&self) {
        self.supervisor.kill(None);
    }

    /// Wait until every task has exited and return the terminal error.
    pub async fn wait(&self) -> Result<(), FirewallError> {
        self.supervisor.wait().await
    }

    /// Convenience for `kill` followed by `wait`.
    pub async fn stop(&self) -> Result<(), FirewallError> {
        self.kill();
        self.wait().await
    }

    pub fn dying(&self) -> CancellationToken {
        self.supervisor.dying()
    }
}

async fn run(
    state: Arc<dyn StateSource>,
    provider: Arc<dyn EnvironProvider>,
    config: FirewallerConfig,
    supervisor: Supervisor,
    dying: CancellationToken,
) -> Result<(), FirewallError> {
    let mut environ_config = state.watch_environ_config().await?;
    let Some(environ) = wait_for_environ(&*state, &*provider, &mut environ_config, &dying).await?
    else {
        return Ok(());
    };

    let mode = environ.config().firewall_mode;
    let strategy = match mode {
        FirewallMode::Instance => PortStrategy::Instance,
        FirewallMode::Global => PortStrategy::Global(GlobalPortRefs::default()),
        FirewallMode::None => {
            warn!("stopping firewaller, firewall-mode is \"none\"");
            return Err(FirewallError::FirewallDisabled {
                mode: mode.to_string(),
            });
        }
    };
    info!(mode = %mode, "firewaller started");

    let machines = state.watch_machines().await?;
    let ports = state.watch_opened_ports().await?;
    let (engine, units, exposed) = Engine::new(state, environ, supervisor, dying, config, strategy);
    engine
        .run(Inputs {
            environ_config,
            machines,
            ports,
            units,
            exposed,
        })
        .await
}

/// Block until the environment configuration opens a usable environ.
/// `None` means the tree started dying first.
async fn wait_for_environ(
    state: &dyn StateSource,
    provider: &dyn EnvironProvider,
    watcher: &mut NotifyWatcher,
    dying: &CancellationToken,
) -> Result<Option<Arc<dyn Environ>>, FirewallError> {
    loop {
        tokio::select! {
            biased;
            () = dying.cancelled() => return Ok(None),
            change = watcher.next() => {
                if change.is_none() {
                    return Err(FirewallError::watcher_closed(watcher.name()));
                }
            }
        }
        let config = state.environ_config().await?;
        match provider.open(config).await {
            Ok(environ) => return Ok(Some(environ)),
            Err(err) => error!(error = %err, "loaded invalid environment configuration"),
        }
    }
}
