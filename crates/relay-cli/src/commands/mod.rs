//! CLI command implementations

pub mod health;
pub mod models;
pub mod run;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use colored::Colorize;
use relay_foundation::adapters::{
    EngineError, EngineLoader, InferenceEngine, LocalWeightsFactory, RemoteHttpFactory,
};
use relay_foundation::{ModelRegistry, RelayConfig};
use relay_kernel::{AdapterFactory, ModelDescriptor};
use tracing::debug;

use crate::CliError;

/// Parse and validate the configuration file.
pub(crate) fn load_config(path: &Path) -> Result<RelayConfig, CliError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| CliError::InvalidArgument(format!("non UTF-8 path: {}", path.display())))?;
    debug!(path = path_str, "loading configuration");
    Ok(RelayConfig::load(path_str)?)
}

/// Registry built from the configuration, optionally with preloads applied.
pub(crate) async fn open_registry(
    path: &Path,
    preload: bool,
) -> Result<(RelayConfig, ModelRegistry), CliError> {
    let config = load_config(path)?;
    let registry = config.build_registry(factories())?;
    if preload {
        for (model, result) in registry.preload().await {
            if let Err(err) = result {
                eprintln!("{} preload of '{}' failed: {}", "!".yellow(), model, err);
            }
        }
    }
    Ok((config, registry))
}

/// Adapter factories compiled into this binary.
fn factories() -> Vec<Arc<dyn AdapterFactory>> {
    vec![
        Arc::new(RemoteHttpFactory::new()),
        Arc::new(LocalWeightsFactory::new(Arc::new(NoLocalEngine))),
    ]
}

/// Local models may be declared, but this binary links no inference engine,
/// so loading one fails with an explicit reason.
struct NoLocalEngine;

impl EngineLoader for NoLocalEngine {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        Err(EngineError::Weights(format!(
            "relay-cli has no local inference engine; cannot load '{}'",
            descriptor.id
        )))
    }
}
