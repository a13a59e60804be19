//! `relay models` command implementation

use std::path::Path;

use colored::Colorize;
use relay_foundation::ModelSnapshot;
use serde::Serialize;

use super::open_registry;
use crate::CliError;
use crate::output::{OutputFormat, print_json, print_table};

/// Execute the `relay models` command
pub async fn run(config: &Path, preload: bool, format: OutputFormat) -> Result<(), CliError> {
    let (_, registry) = open_registry(config, preload).await?;
    let snapshots = registry.list_models();

    match format {
        OutputFormat::Json => print_json(&snapshots)?,
        OutputFormat::Text | OutputFormat::Table => {
            if snapshots.is_empty() {
                println!("  No models declared in {}.", config.display());
            } else {
                println!("{} {} model(s)", "→".green(), snapshots.len());
                let rows: Vec<ModelRow> = snapshots.iter().map(ModelRow::from).collect();
                print_table(&rows)?;
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct ModelRow {
    id: String,
    family: String,
    state: String,
    memory_mb: u64,
    context_window: u32,
    capabilities: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

impl From<&ModelSnapshot> for ModelRow {
    fn from(snapshot: &ModelSnapshot) -> Self {
        let descriptor = &snapshot.descriptor;
        let capabilities: Vec<&str> = descriptor
            .capabilities
            .tags
            .iter()
            .map(|c| c.as_str())
            .collect();
        Self {
            id: descriptor.id.to_string(),
            family: descriptor.family.to_string(),
            state: snapshot.state.to_string(),
            memory_mb: descriptor.resources.memory_mb,
            context_window: descriptor.capabilities.context_window,
            capabilities: capabilities.join(","),
            endpoint: descriptor.endpoint.clone(),
        }
    }
}
