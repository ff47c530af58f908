use anyhow::{Context, Result};
use serde::Serialize;
use tabled::settings::{Padding, Style};
use tabled::{Table, Tabled};

/// How command results are printed on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

pub fn format_list<T: Serialize + Tabled>(rows: &[T], fmt: OutputFormat) -> Result<String> {
    match fmt {
        OutputFormat::Table => Ok(Table::new(rows)
            .with(Style::empty())
            .with(Padding::new(0, 2, 0, 0))
            .to_string()),
        OutputFormat::Json => serde_json::to_string_pretty(rows).context("Failed to render JSON"),
        OutputFormat::Yaml => serde_yaml::to_string(rows).context("Failed to render YAML"),
    }
}

pub fn format_one<T: Serialize + Tabled>(row: &T, fmt: OutputFormat) -> Result<String> {
    match fmt {
        OutputFormat::Table => format_list(std::slice::from_ref(row), fmt),
        OutputFormat::Json => serde_json::to_string_pretty(row).context("Failed to render JSON"),
        OutputFormat::Yaml => serde_yaml::to_string(row).context("Failed to render YAML"),
    }
}

pub fn render_list<T: Serialize + Tabled>(rows: &[T], fmt: OutputFormat) -> Result<()> {
    println!("{}", format_list(rows, fmt)?.trim_end());
    Ok(())
}

pub fn render_one<T: Serialize + Tabled>(row: &T, fmt: OutputFormat) -> Result<()> {
    println!("{}", format_one(row, fmt)?.trim_end());
    Ok(())
}

/// JSON or YAML for values that have no single-table shape.
pub fn format_structured<T: Serialize>(value: &T, fmt: OutputFormat) -> Result<Option<String>> {
    match fmt {
        OutputFormat::Table => Ok(None),
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map(Some)
            .context("Failed to render JSON"),
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map(Some)
            .context("Failed to render YAML"),
    }
}
