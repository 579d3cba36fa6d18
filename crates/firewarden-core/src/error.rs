// ── Core error types ──
//
// Errors surfaced by the reconciliation engine. Collaborators (state store,
// provider) report through the same enum so the controller loop can tell
// tolerated conditions (entity gone, machine not provisioned) apart from
// fatal ones with a single match.

use thiserror::Error;

/// Validation failures for domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid port range {range:?}: {reason}")]
    InvalidPortRange { range: String, reason: String },

    #[error("invalid unit name {name:?}: expected <service>/<number>")]
    InvalidUnitName { name: String },
}

/// Unified error type for the engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum FirewallError {
    // ── Tolerated lookups ────────────────────────────────────────────
    #[error("{entity} {id:?} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("machine {machine:?} is not provisioned")]
    NotProvisioned { machine: String },

    #[error("unit {unit:?} is not assigned to a machine")]
    NotAssigned { unit: String },

    #[error("no instances found for {instance:?}")]
    NoInstances { instance: String },

    #[error("port range {range} on {network:?} is already open for unit {owner:?}")]
    PortConflict {
        range: String,
        network: String,
        owner: String,
    },

    // ── Provider ─────────────────────────────────────────────────────
    #[error("provider {operation} failed: {message}")]
    Provider { operation: String, message: String },

    // ── Watches ──────────────────────────────────────────────────────
    #[error("{watcher} watcher closed")]
    WatcherClosed { watcher: String },

    #[error("invalid ports change {key:?}: {reason}")]
    InvalidPortsKey { key: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("firewaller is disabled when firewall-mode is {mode:?}")]
    FirewallDisabled { mode: String },

    #[error("invalid environment configuration: {message}")]
    InvalidConfig { message: String },

    // ── Wrapped ──────────────────────────────────────────────────────
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FirewallError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl FirewallError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn watcher_closed(watcher: impl Into<String>) -> Self {
        Self::WatcherClosed {
            watcher: watcher.into(),
        }
    }

    /// Wrap this error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through any `Context` layers.
    pub fn root(&self) -> &FirewallError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// The entity an accessor asked for no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    /// The machine has no provider instance yet.
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self.root(), Self::NotProvisioned { .. })
    }

    /// The provider has no instance with the requested id.
    pub fn is_no_instances(&self) -> bool {
        matches!(self.root(), Self::NoInstances { .. })
    }
}

/// Attach context to fallible engine operations.
pub(crate) trait ResultExt<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, FirewallError>;
}

impl<T> ResultExt<T> for Result<T, FirewallError> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, FirewallError> {
        self.map_err(|err| err.context(context()))
    }
}
