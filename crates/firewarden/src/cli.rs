//! Clap derive structures for the `firewarden` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use firewarden_core::FirewallMode;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// firewarden -- keep provider firewall rules in step with declared state
#[derive(Debug, Parser)]
#[command(
    name = "firewarden",
    version,
    about = "Reconcile cloud firewall rules with declared cluster state",
    long_about = "Drives the firewarden reconciliation engine.\n\n\
        `simulate` replays a YAML scenario against the in-memory state store\n\
        and provider, then reports the provider's final port tables and the\n\
        open/close calls the engine issued.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "FIREWARDEN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "FIREWARDEN_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one line per record (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a scenario against the in-memory state store and provider
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Validate and print the effective configuration
    CheckConfig,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Scenario file (YAML)
    pub scenario: PathBuf,

    /// Override the scenario's firewall mode (instance, global, none)
    #[arg(long)]
    pub mode: Option<FirewallMode>,

    /// Quiet period, in milliseconds, that ends each step
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Leave the call log out of table and plain output
    #[arg(long)]
    pub no_calls: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
