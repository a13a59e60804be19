//! `relay validate` command implementation

use std::path::Path;

use colored::Colorize;
use serde_json::json;

use super::load_config;
use crate::CliError;
use crate::output::{OutputFormat, print_json};

/// Execute the `relay validate` command
pub fn run(config: &Path, format: OutputFormat) -> Result<(), CliError> {
    let relay_config = load_config(config)?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "valid": true,
            "path": config.display().to_string(),
            "models": relay_config.models.len(),
            "capacity_mb": relay_config.registry.capacity_mb,
            "preload": relay_config.registry.preload,
        }))?,
        OutputFormat::Text | OutputFormat::Table => {
            println!(
                "{} {} is valid: {} model(s), capacity {} MB",
                "✓".green(),
                config.display(),
                relay_config.models.len(),
                relay_config.registry.capacity_mb
            );
        }
    }
    Ok(())
}
