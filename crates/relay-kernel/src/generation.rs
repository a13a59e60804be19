//! Request and chunk types that flow between the orchestrator, the context
//! assembler and backend adapters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::model::{CapabilityRequirements, ModelId};

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// A passage returned by the retrieval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub text: String,
    pub score: f32,
    pub source_id: String,
}

impl RetrievedPassage {
    pub fn new(text: impl Into<String>, score: f32, source_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            score,
            source_id: source_id.into(),
        }
    }
}

// ============================================================================
// Shaping parameters
// ============================================================================

/// Caller-supplied named numeric controls.
///
/// `temperature`, `top_p` and `max_tokens` map onto typed generation
/// parameters. Every other key is an opaque influence knob passed to the
/// adapter after clamping; no meaning is attached to its name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapingParameters {
    pub values: BTreeMap<String, f64>,
}

impl ShapingParameters {
    pub const TEMPERATURE: &'static str = "temperature";
    pub const TOP_P: &'static str = "top_p";
    pub const MAX_TOKENS: &'static str = "max_tokens";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Keys other than the typed parameters.
    pub fn influences(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    Self::TEMPERATURE | Self::TOP_P | Self::MAX_TOKENS
                )
            })
            .map(|(k, v)| (k.as_str(), *v))
    }
}

/// Inclusive valid range of one numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl ParamRange {
    pub const fn new(min: f64, max: f64, default: f64) -> Self {
        Self { min, max, default }
    }

    /// Clamp `value` into the range. Non-finite input yields the default.
    /// The flag reports whether the value changed.
    pub fn clamp(&self, value: f64) -> (f64, bool) {
        if !value.is_finite() {
            return (self.default, true);
        }
        let clamped = value.clamp(self.min, self.max);
        (clamped, clamped != value)
    }
}

/// Valid parameter ranges declared by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub temperature: ParamRange,
    pub top_p: ParamRange,
    pub max_output_tokens: ParamRange,
    /// Range applied to influence knobs without an override.
    pub influence: ParamRange,
    #[serde(default)]
    pub influence_overrides: BTreeMap<String, ParamRange>,
}

impl Default for ParameterRanges {
    fn default() -> Self {
        Self {
            temperature: ParamRange::new(0.1, 2.0, 0.7),
            top_p: ParamRange::new(0.1, 1.0, 0.9),
            max_output_tokens: ParamRange::new(1.0, 4096.0, 512.0),
            influence: ParamRange::new(-1.0, 1.0, 0.0),
            influence_overrides: BTreeMap::new(),
        }
    }
}

impl ParameterRanges {
    pub fn influence_range(&self, name: &str) -> &ParamRange {
        self.influence_overrides.get(name).unwrap_or(&self.influence)
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens.max = f64::from(max);
        if self.max_output_tokens.default > self.max_output_tokens.max {
            self.max_output_tokens.default = self.max_output_tokens.max;
        }
        self
    }

    pub fn with_influence_override(mut self, name: impl Into<String>, range: ParamRange) -> Self {
        self.influence_overrides.insert(name.into(), range);
        self
    }
}

/// Fully resolved, adapter-agnostic generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub influences: BTreeMap<String, f64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_output_tokens: 512,
            stop: Vec::new(),
            influences: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Adapter-facing request and chunks
// ============================================================================

/// Final, backend-agnostic request handed to an adapter.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Resolved target, never a hint.
    pub model_id: ModelId,
    pub messages: Vec<ConversationTurn>,
    pub params: GenerationParams,
    pub cancel: CancellationToken,
}

impl GenerationRequest {
    pub fn new(model_id: impl Into<ModelId>, messages: Vec<ConversationTurn>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            params: GenerationParams::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One piece of adapter output.
///
/// Sequence numbers start at 0 and increase by one per chunk. A chunk with
/// `finish` set is the last one the adapter yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterChunk {
    pub sequence: u64,
    pub text: String,
    pub finish: Option<FinishReason>,
}

impl AdapterChunk {
    pub fn text(sequence: u64, text: impl Into<String>) -> Self {
        Self {
            sequence,
            text: text.into(),
            finish: None,
        }
    }

    pub fn finish(sequence: u64, reason: FinishReason) -> Self {
        Self {
            sequence,
            text: String::new(),
            finish: Some(reason),
        }
    }

    pub fn is_final(&self) -> bool {
        self.finish.is_some()
    }
}

// ============================================================================
// Caller-facing request and chunks
// ============================================================================

/// Request submitted by the chat-session layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub model_hint: Option<ModelId>,
    #[serde(default)]
    pub shaping_parameters: ShapingParameters,
    #[serde(default)]
    pub required_capabilities: CapabilityRequirements,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Caller-owned cancellation; the orchestrator derives a child token.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl InboundRequest {
    pub fn new(conversation_history: Vec<ConversationTurn>) -> Self {
        Self {
            conversation_history,
            ..Self::default()
        }
    }

    /// Single user turn.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ConversationTurn::user(text)])
    }

    pub fn with_model_hint(mut self, model: impl Into<ModelId>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub fn with_shaping(mut self, shaping: ShapingParameters) -> Self {
        self.shaping_parameters = shaping;
        self
    }

    pub fn with_requirements(mut self, required: CapabilityRequirements) -> Self {
        self.required_capabilities = required;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.conversation_history
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }
}

/// One chunk of the response stream relayed to the caller.
///
/// Every session ends with exactly one chunk where `done` is true and
/// `finish_reason` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub sequence: u64,
    pub text_delta: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Model that produced the chunk (set on every chunk once routed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<ModelId>,
    /// Partial output was streamed before the failure that ended the session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseChunk {
    pub fn delta(sequence: u64, text: impl Into<String>, model_id: Option<ModelId>) -> Self {
        Self {
            sequence,
            text_delta: text.into(),
            done: false,
            finish_reason: None,
            model_id,
            incomplete: false,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn terminal(sequence: u64, reason: FinishReason) -> Self {
        Self {
            sequence,
            text_delta: String::new(),
            done: true,
            finish_reason: Some(reason),
            model_id: None,
            incomplete: false,
            warnings: Vec::new(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_range_clamps_and_flags() {
        let range = ParamRange::new(0.1, 2.0, 0.7);
        assert_eq!(range.clamp(1.0), (1.0, false));
        assert_eq!(range.clamp(5.0), (2.0, true));
        assert_eq!(range.clamp(0.0), (0.1, true));
        assert_eq!(range.clamp(f64::NAN), (0.7, true));
        assert_eq!(range.clamp(f64::INFINITY), (0.7, true));
    }

    #[test]
    fn influences_exclude_typed_keys() {
        let shaping = ShapingParameters::new()
            .with("temperature", 0.3)
            .with("max_tokens", 64.0)
            .with("warmth", 0.4);
        let influences: Vec<_> = shaping.influences().collect();
        assert_eq!(influences, vec![("warmth", 0.4)]);
    }

    #[test]
    fn influence_override_wins_over_default_range() {
        let ranges = ParameterRanges::default()
            .with_influence_override("curiosity", ParamRange::new(0.0, 5.0, 1.0));
        assert_eq!(ranges.influence_range("curiosity").max, 5.0);
        assert_eq!(ranges.influence_range("warmth").max, 1.0);
    }

    #[test]
    fn finish_reason_serializes_lowercase() {
        let chunk = ResponseChunk::terminal(3, FinishReason::Cancelled);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["finish_reason"], "cancelled");
        assert_eq!(json["done"], true);
        assert!(json.get("incomplete").is_none());
        assert!(json.get("warnings").is_none());
    }

    #[test]
    fn inbound_request_deserializes_with_defaults() {
        let json = r#"{
            "conversation_history": [
                {"role": "system", "text": "be brief"},
                {"role": "user", "text": "hello"}
            ],
            "shaping_parameters": {"temperature": 0.2},
            "required_capabilities": ["streaming"]
        }"#;
        let req: InboundRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.last_user_text(), Some("hello"));
        assert_eq!(req.shaping_parameters.get("temperature"), Some(0.2));
        assert_eq!(req.required_capabilities.tags.len(), 1);
        assert!(req.model_hint.is_none());
        assert!(req.cancel.is_none());
    }
}
