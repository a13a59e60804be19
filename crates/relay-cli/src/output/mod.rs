//! Output formatting module
//!
//! Commands print either human-readable text, JSON for automation, or a table.

mod table;

pub use table::Table;

use serde::Serialize;

use crate::CliError;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for automation
    Json,
    /// Table-formatted output
    Table,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Pretty-print any serializable value on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a list of records as a table.
pub fn print_table<T: Serialize>(rows: &[T]) -> Result<(), CliError> {
    let json = serde_json::to_value(rows)?;
    if let Some(arr) = json.as_array() {
        println!("{}", Table::from_json_array(arr));
    }
    Ok(())
}
