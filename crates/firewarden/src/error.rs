//! CLI error types with miette diagnostics.
//!
//! Maps engine and config failures into user-facing errors with
//! actionable help text.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use firewarden_config::ConfigError;
use firewarden_core::FirewallError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const ENGINE: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(firewarden::config),
        help("Run `firewarden check-config` to see the effective configuration.")
    )]
    Config(#[from] ConfigError),

    // ── Scenarios ────────────────────────────────────────────────────
    #[error("Scenario file {} not found", path.display())]
    #[diagnostic(code(firewarden::scenario_not_found))]
    ScenarioNotFound { path: PathBuf },

    #[error("Could not read scenario {}", path.display())]
    #[diagnostic(code(firewarden::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario {}", path.display())]
    #[diagnostic(
        code(firewarden::scenario_invalid),
        help("Each step needs an `action` key, e.g. `- action: expose` with `service: web`.")
    )]
    Scenario {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Scenario setup failed: {source}")]
    #[diagnostic(code(firewarden::scenario_setup))]
    Setup {
        #[source]
        source: FirewallError,
    },

    #[error("Step {index} ({action}) failed: {source}")]
    #[diagnostic(
        code(firewarden::step_failed),
        help("Steps run in order against the state built so far.")
    )]
    Step {
        index: usize,
        action: String,
        #[source]
        source: FirewallError,
    },

    // ── Engine ───────────────────────────────────────────────────────
    #[error("The firewaller is disabled for firewall-mode {mode}")]
    #[diagnostic(
        code(firewarden::disabled),
        help("Set `firewall-mode` to `instance` or `global`, or pass --mode.")
    )]
    Disabled { mode: String },

    #[error("The firewaller stopped: {source}")]
    #[diagnostic(code(firewarden::engine))]
    Engine {
        #[source]
        source: FirewallError,
    },

    // ── Output ───────────────────────────────────────────────────────
    #[error("Could not render output: {0}")]
    #[diagnostic(code(firewarden::render))]
    Render(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(ConfigError::NotFound(_)) | Self::ScenarioNotFound { .. } => {
                exit_code::NOT_FOUND
            }
            Self::Config(_) | Self::Scenario { .. } | Self::Disabled { .. } => exit_code::USAGE,
            Self::Setup { .. } | Self::Step { .. } => exit_code::CONFLICT,
            Self::Engine { .. } => exit_code::ENGINE,
            Self::Io { .. } | Self::Render(_) => exit_code::GENERAL,
        }
    }
}

// ── FirewallError → CliError mapping ─────────────────────────────────

impl From<FirewallError> for CliError {
    fn from(err: FirewallError) -> Self {
        match err.root() {
            FirewallError::FirewallDisabled { mode } => Self::Disabled { mode: mode.clone() },
            _ => Self::Engine { source: err },
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Render(err.to_string())
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Render(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mode_maps_to_usage() {
        let err = CliError::from(FirewallError::FirewallDisabled {
            mode: "none".into(),
        });
        assert!(matches!(err, CliError::Disabled { .. }));
        assert_eq!(err.exit_code(), exit_code::USAGE);
    }

    #[test]
    fn provider_failure_maps_to_engine() {
        let err = CliError::from(FirewallError::provider("open-ports", "injected failure"));
        assert_eq!(err.exit_code(), exit_code::ENGINE);
        assert!(err.to_string().contains("injected failure"));
    }

    #[test]
    fn missing_config_file_is_not_found() {
        let err = CliError::from(ConfigError::NotFound(PathBuf::from("/nope.toml")));
        assert_eq!(err.exit_code(), exit_code::NOT_FOUND);
    }
}
