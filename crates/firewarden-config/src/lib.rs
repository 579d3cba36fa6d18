//! Configuration for the firewarden engine and CLI.
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file,
//! then `FIREWARDEN_`-prefixed environment variables (`__` separates
//! sections, e.g. `FIREWARDEN_ENGINE__UNITS_CHANNEL_SIZE=128`).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use firewarden_core::FirewallerConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub simulation: SimulationSettings,
}

/// Controller loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default = "default_channel_size")]
    pub units_channel_size: usize,

    #[serde(default = "default_channel_size")]
    pub exposed_channel_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            units_channel_size: default_channel_size(),
            exposed_channel_size: default_channel_size(),
        }
    }
}

fn default_channel_size() -> usize {
    64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogSettings {
    /// Default filter when no `-v` flag or `RUST_LOG` is given.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String {
    "warn".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SimulationSettings {
    /// How long a simulation step waits for the engine to go quiet.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_settle_ms() -> u64 {
    50
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

impl Config {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.units_channel_size == 0 {
            return Err(ConfigError::Validation {
                field: "engine.units_channel_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.engine.exposed_channel_size == 0 {
            return Err(ConfigError::Validation {
                field: "engine.exposed_channel_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation {
                field: "log.level".into(),
                reason: format!("expected one of {}, got '{}'", LEVELS.join(", "), self.log.level),
            });
        }
        Ok(())
    }

    pub fn to_firewaller_config(&self) -> FirewallerConfig {
        FirewallerConfig {
            units_channel_size: self.engine.units_channel_size,
            exposed_channel_size: self.engine.exposed_channel_size,
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "firewarden", "firewarden").map_or_else(
        || PathBuf::from(".firewarden").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FIREWARDEN_").split("__"))
}

/// Load from the canonical path. A missing file means defaults.
pub fn load_config() -> Result<Config, ConfigError> {
    let config: Config = figment(&config_path()).extract()?;
    config.validate()?;
    Ok(config)
}

/// Load from an explicit file, which must exist.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.to_firewaller_config(), FirewallerConfig::default());
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.simulation.settle_ms, 50);
    }

    #[test]
    fn file_overrides_defaults() {
        let file = write_config(
            r#"
            [engine]
            units_channel_size = 8

            [log]
            level = "debug"
            format = "json"
            "#,
        );
        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.engine.units_channel_size, 8);
        assert_eq!(config.engine.exposed_channel_size, 64);
        assert_eq!(config.to_firewaller_config().units_channel_size, 8);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn zero_channel_size_is_rejected() {
        let file = write_config("[engine]\nexposed_channel_size = 0\n");
        let err = load_config_from(file.path()).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { ref field, .. } if field == "engine.exposed_channel_size"),
            "got: {err}"
        );
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let file = write_config("[log]\nlevel = \"loud\"\n");
        assert!(matches!(
            load_config_from(file.path()),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn malformed_file_is_a_figment_error() {
        let file = write_config("[engine\n");
        assert!(matches!(
            load_config_from(file.path()),
            Err(ConfigError::Figment(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn toml_rendering_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[engine]"));
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
