//! Runtime configuration file.
//!
//! One file declares the registry settings, the orchestrator settings and
//! the startup model list. Any format supported by
//! [`relay_kernel::config`] works; `${VAR}` references are substituted and
//! `RELAY_` prefixed environment variables override file values, with `__`
//! separating nested keys (`RELAY_REGISTRY__CAPACITY_MB=8192`).
//!
//! # Example (relay.yaml)
//!
//! ```yaml
//! registry:
//!   capacity_mb: 24576
//!   load_timeout_secs: 90
//!   preload: [qwen-local]
//!
//! orchestrator:
//!   max_fallback_attempts: 1
//!
//! models:
//!   - id: qwen-local
//!     family: local
//!     endpoint: /models/qwen2.5-7b
//!     resources: { memory_mb: 8192, accelerator: cuda }
//!     capabilities: { tags: [text-generation, streaming], context_window: 8192 }
//!   - id: gpt-remote
//!     family: remote_http
//!     endpoint: https://api.example.com
//!     capabilities: { tags: [text-generation, streaming], context_window: 128000 }
//!     settings: { model: gpt-4o-mini, api_key_env: OPENAI_API_KEY }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use error_stack::ResultExt;
use relay_kernel::config::{self as loader, FileFormat};
use relay_kernel::error::IntoRelayReport;
use relay_kernel::{AdapterFactory, ModelDescriptor, RelayError, RelayReport, RelayResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::orchestrator::{GenerationOrchestrator, OrchestratorConfig};
use crate::registry::{ModelRegistry, RegistryConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RELAY";

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub models: Vec<ModelDescriptor>,
}

impl RelayConfig {
    /// Load from a file, applying `RELAY_` environment overrides.
    pub fn load(path: &str) -> RelayReport<Self> {
        let config: Self = loader::load_with_env(path, ENV_PREFIX)
            .map_err(RelayError::from)
            .into_report()
            .attach(format!("config file: {path}"))?;
        config
            .validate()
            .into_report()
            .attach(format!("config file: {path}"))?;
        Ok(config)
    }

    /// Parse from a string without environment overrides.
    pub fn from_str(content: &str, format: FileFormat) -> RelayReport<Self> {
        let config: Self = loader::from_str(content, format)
            .map_err(RelayError::from)
            .into_report()
            .attach("parsing inline config")?;
        config.validate().into_report().attach("validating inline config")?;
        Ok(config)
    }

    /// Non-zero registry limits, descriptor checks, unique ids, and a preload
    /// list naming declared models.
    pub fn validate(&self) -> RelayResult<()> {
        if self.registry.capacity_mb == 0 {
            return Err(RelayError::Config(
                "registry.capacity_mb must be greater than zero".to_string(),
            ));
        }
        if self.registry.load_timeout_secs == 0 {
            return Err(RelayError::Config(
                "registry.load_timeout_secs must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for descriptor in &self.models {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(RelayError::Config(format!(
                    "model '{}' is declared twice",
                    descriptor.id
                )));
            }
        }
        if let Some(missing) = self.registry.preload.iter().find(|id| !seen.contains(*id)) {
            return Err(RelayError::Config(format!(
                "preload names undeclared model '{missing}'"
            )));
        }
        Ok(())
    }

    /// Build a registry with the given factories and register every declared
    /// model. Preloading is left to the caller.
    pub fn build_registry(
        &self,
        factories: impl IntoIterator<Item = Arc<dyn AdapterFactory>>,
    ) -> RelayReport<ModelRegistry> {
        let registry = ModelRegistry::new(self.registry.clone());
        for factory in factories {
            registry.register_factory(factory);
        }
        for descriptor in &self.models {
            let id = descriptor.id.clone();
            registry
                .register(descriptor.clone())
                .into_report()
                .attach(format!("registering model '{id}'"))?;
        }
        info!(
            models = self.models.len(),
            capacity_mb = self.registry.capacity_mb,
            "registry configured"
        );
        Ok(registry)
    }

    pub fn build_orchestrator(&self, registry: ModelRegistry) -> GenerationOrchestrator {
        GenerationOrchestrator::new(registry, self.orchestrator.clone())
    }
}
