//! `firewarden check-config`: print the effective configuration.

use crate::cli::GlobalOpts;
use crate::config::Loaded;
use crate::error::CliError;
use crate::output;

pub fn handle(loaded: &Loaded, global: &GlobalOpts) -> Result<(), CliError> {
    let toml = loaded.config.to_toml()?;
    let source = if loaded.from_file {
        loaded.path.display().to_string()
    } else {
        format!("{} (not found, using defaults)", loaded.path.display())
    };

    let rendered = output::render(
        &global.output,
        &loaded.config,
        |_| format!("# source: {source}\n{toml}"),
        |_| toml.clone(),
    )?;
    output::print_output(rendered.trim_end(), global.quiet);
    Ok(())
}
