//! CLI configuration: resolves the config file from `--config` or the
//! platform default and loads it through `firewarden_config`.

use std::path::PathBuf;

pub use firewarden_config::{Config, LogFormat, LogSettings, config_path};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// A loaded configuration and the file it was read from.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    pub path: PathBuf,
    /// Whether the file exists; a missing default file means defaults.
    pub from_file: bool,
}

/// Load the configuration an invocation runs with.
///
/// An explicit `--config` must exist; the default path may be absent.
pub fn resolve(global: &GlobalOpts) -> Result<Loaded, CliError> {
    if let Some(path) = &global.config {
        let config = firewarden_config::load_config_from(path)?;
        return Ok(Loaded {
            config,
            path: path.clone(),
            from_file: true,
        });
    }
    let path = config_path();
    let config = firewarden_config::load_config()?;
    Ok(Loaded {
        from_file: path.exists(),
        config,
        path,
    })
}
