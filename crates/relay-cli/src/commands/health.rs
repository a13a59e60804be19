//! `relay health` command implementation

use std::path::Path;

use colored::Colorize;
use relay_foundation::{HealthStatus, RegistryHealth};

use super::open_registry;
use crate::CliError;
use crate::output::{OutputFormat, print_json, print_table};

/// Execute the `relay health` command
pub async fn run(config: &Path, preload: bool, format: OutputFormat) -> Result<(), CliError> {
    let (_, registry) = open_registry(config, preload).await?;
    let health = registry.health();

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => print_table(std::slice::from_ref(&health))?,
        OutputFormat::Text => print_text(&health),
    }

    registry.shutdown().await;
    Ok(())
}

fn print_text(health: &RegistryHealth) {
    let status = match health.status {
        HealthStatus::Healthy => "healthy".green(),
        HealthStatus::Degraded => "degraded".yellow(),
    };
    println!("{} Registry {}", "→".green(), status);
    println!(
        "  Capacity:  {}/{} MB committed",
        health.committed_mb, health.capacity_mb
    );
    println!(
        "  Models:    {} registered, {} resident, {} degraded",
        health.registered_models, health.resident_models, health.degraded_models
    );
    println!(
        "  Loads:     {} attempted, {} ok, {} failed, {} timed out",
        health.load_attempts, health.load_successes, health.load_failures, health.load_timeouts
    );
    if let Some(ms) = health.average_load_ms {
        println!("  Avg load:  {ms:.0} ms");
    }
}
