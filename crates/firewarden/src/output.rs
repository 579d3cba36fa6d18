//! Output formatting: table, JSON, YAML, plain.
//!
//! Renders data in the format selected by `--output`. Table uses `tabled`,
//! structured formats use serde, plain emits one record per line.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: &ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// Paint a port operation: opens green, closes red.
pub fn paint_op(op: &str, color: bool) -> String {
    if !color {
        return op.to_owned();
    }
    match op {
        "open" => op.green().to_string(),
        "close" => op.red().to_string(),
        _ => op.to_owned(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a serde-serializable value in the chosen format.
///
/// `table_fn` and `plain_fn` produce the human-oriented renderings; the
/// structured formats serialize `data` directly.
pub fn render<T>(
    format: &OutputFormat,
    data: &T,
    table_fn: impl FnOnce(&T) -> String,
    plain_fn: impl FnOnce(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
{
    Ok(match format {
        OutputFormat::Table => table_fn(data),
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
        OutputFormat::Yaml => serde_yaml::to_string(data)?,
        OutputFormat::Plain => plain_fn(data),
    })
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

pub fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[derive(Serialize, Tabled)]
    struct Row {
        name: String,
    }

    fn row() -> Row {
        Row { name: "web".into() }
    }

    #[test]
    fn json_serializes_data() {
        let out = render(&OutputFormat::JsonCompact, &row(), |_| String::new(), |_| String::new())
            .unwrap();
        assert_eq!(out, r#"{"name":"web"}"#);
    }

    #[test]
    fn table_and_plain_use_callbacks() {
        let table = render(
            &OutputFormat::Table,
            &row(),
            |r| render_table(std::slice::from_ref(r)),
            |r| r.name.clone(),
        )
        .unwrap();
        assert!(table.contains("web"));
        assert!(table.contains('╭'));

        let plain =
            render(&OutputFormat::Plain, &row(), |_| String::new(), |r| r.name.clone()).unwrap();
        assert_eq!(plain, "web");
    }

    #[test]
    fn paint_is_identity_without_color() {
        assert_eq!(paint_op("open", false), "open");
        assert_ne!(paint_op("open", true), "open");
    }
}
