mod cli;
mod commands;
mod config;
mod error;
mod output;
mod scenario;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::{LogFormat, LogSettings};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file, so load it first; a
    // broken config is reported once tracing is up.
    let loaded = config::resolve(&cli.global);
    let log = match &loaded {
        Ok(loaded) => loaded.config.log.clone(),
        Err(_) => LogSettings::default(),
    };
    init_tracing(cli.global.verbose, &log);

    if let Err(err) = run(cli, loaded).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, log: &LogSettings) {
    let filter = match verbosity {
        0 => log.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(cli: Cli, loaded: Result<config::Loaded, CliError>) -> Result<(), CliError> {
    match cli.command {
        // Shell completions don't need a config
        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "firewarden", &mut std::io::stdout());
            Ok(())
        }

        Command::CheckConfig => commands::check_config::handle(&loaded?, &cli.global),

        Command::Simulate(args) => {
            commands::simulate::handle(&args, &loaded?, &cli.global).await
        }
    }
}
