//! Model declarations, capability sets and lifecycle states.
//!
//! A [`ModelDescriptor`] is what an operator declares; the registry turns it
//! into a tracked model whose [`ModelState`] moves through:
//!
//! ```text
//!  Unregistered ──register──▶ Registered ──ensure_loaded──▶ Loading ──ok──▶ Ready
//!                                 ▲  ▲                         │             │
//!                                 │  └──────── timeout ────────┤      mark_degraded
//!                                 │                            │             ▼
//!                                 │        Failed ◀── error ───┘         Degraded
//!                                 │                                          │
//!                                 └──────────────── Unloading ◀── evict ─────┘
//! ```

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// ============================================================================
// Identity
// ============================================================================

/// Stable, unique model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ModelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ModelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Engine family; selects the adapter factory that constructs the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelFamily {
    /// Weights resident in this process.
    LocalWeights,
    /// A remote OpenAI-compatible completion service.
    RemoteHttp,
    Other(String),
}

impl ModelFamily {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LocalWeights => "local",
            Self::RemoteHttp => "remote_http",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for ModelFamily {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "local" | "local_weights" => Self::LocalWeights,
            "remote" | "remote_http" | "http" => Self::RemoteHttp,
            _ => Self::Other(value),
        }
    }
}

impl From<ModelFamily> for String {
    fn from(value: ModelFamily) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Compute device a model must run on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Accelerator {
    Cpu,
    Cuda,
    Metal,
    Rocm,
    Other(String),
}

impl From<String> for Accelerator {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "cuda" => Self::Cuda,
            "metal" => Self::Metal,
            "rocm" => Self::Rocm,
            _ => Self::Other(value),
        }
    }
}

impl From<Accelerator> for String {
    fn from(value: Accelerator) -> Self {
        match value {
            Accelerator::Cpu => "cpu".into(),
            Accelerator::Cuda => "cuda".into(),
            Accelerator::Metal => "metal".into(),
            Accelerator::Rocm => "rocm".into(),
            Accelerator::Other(name) => name,
        }
    }
}

/// Approximate resources a resident model commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Memory estimate in MB, charged against registry capacity while resident.
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub accelerator: Option<Accelerator>,
}

// ============================================================================
// Capabilities
// ============================================================================

/// Declared feature of a model, used as a routing filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    TextGeneration,
    Streaming,
    FunctionCalling,
    Other(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Self::TextGeneration => "text-generation",
            Self::Streaming => "streaming",
            Self::FunctionCalling => "function-calling",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().replace('_', "-").as_str() {
            "text-generation" | "text" => Self::TextGeneration,
            "streaming" => Self::Streaming,
            "function-calling" | "tools" => Self::FunctionCalling,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability tags plus the context window a model accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub tags: BTreeSet<Capability>,
    /// Context window size in tokens.
    pub context_window: u32,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            tags: BTreeSet::from([Capability::TextGeneration]),
            context_window: 4096,
        }
    }
}

impl CapabilitySet {
    pub fn new(context_window: u32) -> Self {
        Self {
            tags: BTreeSet::new(),
            context_window,
        }
    }

    pub fn with(mut self, capability: impl Into<Capability>) -> Self {
        self.tags.insert(capability.into());
        self
    }

    pub fn has(&self, capability: &Capability) -> bool {
        self.tags.contains(capability)
    }

    /// Tags required but not declared.
    pub fn missing(&self, required: &CapabilityRequirements) -> Vec<Capability> {
        required
            .tags
            .iter()
            .filter(|tag| !self.tags.contains(*tag))
            .cloned()
            .collect()
    }

    pub fn satisfies(&self, required: &CapabilityRequirements) -> bool {
        required.tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Capability tags a request needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityRequirements {
    pub tags: BTreeSet<Capability>,
}

impl CapabilityRequirements {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn require(mut self, capability: impl Into<Capability>) -> Self {
        self.tags.insert(capability.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl fmt::Display for CapabilityRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.tags.iter().map(Capability::as_str).collect();
        write!(f, "[{}]", tags.join(", "))
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unregistered,
    Registered,
    Loading,
    Ready,
    Degraded,
    Unloading,
    Failed,
}

impl ModelState {
    /// Whether the model currently holds committed capacity.
    pub fn is_resident(self) -> bool {
        matches!(self, Self::Loading | Self::Ready | Self::Degraded | Self::Unloading)
    }

    /// Whether automatic routing may pick the model.
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            Self::Registered | Self::Loading | Self::Ready | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Declaration of one model, supplied at startup or through `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub family: ModelFamily,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Base URL for remote families; path to weights for local ones.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Free-form adapter settings (model name on the server, api key env var, ...).
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<ModelId>, family: ModelFamily) -> Self {
        Self {
            id: id.into(),
            family,
            resources: ResourceRequirements::default(),
            capabilities: CapabilitySet::default(),
            endpoint: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.resources.memory_mb = memory_mb;
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.resources.accelerator = Some(accelerator);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.tags.insert(capability.into());
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.capabilities.context_window = tokens;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Structural checks that do not depend on any adapter factory.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.id.as_str().trim().is_empty() {
            return Err(RelayError::InvalidDescriptor(
                "model id must not be empty".into(),
            ));
        }
        if self.capabilities.context_window == 0 {
            return Err(RelayError::InvalidDescriptor(format!(
                "model '{}' declares a zero context window",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_and_capability_parse_from_strings() {
        assert_eq!(ModelFamily::from("local".to_string()), ModelFamily::LocalWeights);
        assert_eq!(ModelFamily::from("REMOTE_HTTP".to_string()), ModelFamily::RemoteHttp);
        assert_eq!(
            ModelFamily::from("vllm".to_string()),
            ModelFamily::Other("vllm".into())
        );
        assert_eq!(Capability::from("function_calling"), Capability::FunctionCalling);
        assert_eq!(Capability::from("vision"), Capability::Other("vision".into()));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let json = r#"{
            "id": "m1",
            "family": "remote_http",
            "endpoint": "http://localhost:11434",
            "capabilities": { "tags": ["text-generation", "streaming"], "context_window": 8192 }
        }"#;
        let descriptor: ModelDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.id.as_str(), "m1");
        assert_eq!(descriptor.family, ModelFamily::RemoteHttp);
        assert_eq!(descriptor.resources.memory_mb, 0);
        assert!(descriptor.capabilities.has(&Capability::Streaming));
        assert_eq!(descriptor.capabilities.context_window, 8192);
        assert!(descriptor.settings.is_empty());
    }

    #[test]
    fn capability_requirements_report_missing_tags() {
        let caps = CapabilitySet::new(2048).with(Capability::TextGeneration);
        let req = CapabilityRequirements::none()
            .require(Capability::TextGeneration)
            .require(Capability::FunctionCalling);

        assert!(!caps.satisfies(&req));
        assert_eq!(caps.missing(&req), vec![Capability::FunctionCalling]);
        assert!(caps.satisfies(&CapabilityRequirements::none()));
    }

    #[test]
    fn validate_rejects_empty_id_and_zero_window() {
        let empty = ModelDescriptor::new("  ", ModelFamily::LocalWeights);
        assert!(matches!(empty.validate(), Err(RelayError::InvalidDescriptor(_))));

        let zero = ModelDescriptor::new("m", ModelFamily::LocalWeights).with_context_window(0);
        assert!(matches!(zero.validate(), Err(RelayError::InvalidDescriptor(_))));

        let ok = ModelDescriptor::new("m", ModelFamily::LocalWeights);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn resident_and_routable_states() {
        assert!(ModelState::Ready.is_resident());
        assert!(ModelState::Loading.is_resident());
        assert!(!ModelState::Registered.is_resident());
        assert!(!ModelState::Degraded.is_routable());
        assert!(ModelState::Failed.is_routable());
    }
}
