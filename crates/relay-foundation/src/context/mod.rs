//! Context Assembler - history, retrieved passages and shaping parameters
//! merged into one backend-agnostic [`GenerationRequest`].
//!
//! [`ContextAssembler::build`] is a pure function of its inputs:
//!
//! 1. retrieved passages become one delimited system block placed after the
//!    leading system turns and ahead of the conversation;
//! 2. the oldest unpinned turns are dropped until the estimate fits the
//!    target's context window. System turns and the most recent user turn are
//!    pinned. If the window is still exceeded, the lowest-scoring passages go;
//! 3. shaping parameters are clamped into the target adapter's ranges.
//!
//! Truncation, clamping and missing retrieval are reported as warnings on the
//! [`Assembly`], never as errors.

mod estimator;

pub use estimator::{MESSAGE_OVERHEAD_TOKENS, TokenEstimator, WordBasedEstimator};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use relay_kernel::{
    CapabilitySet, ConversationTurn, GenerationParams, GenerationRequest, ModelAdapter, ModelId,
    ParamRange, ParameterRanges, RelayError, RelayResult, RetrievedPassage, Role,
    ShapingParameters,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of the retrieval lookup for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievedContext {
    /// No retriever configured.
    None,
    Passages(Vec<RetrievedPassage>),
    /// The retriever failed; generation proceeds without context.
    Unavailable(String),
}

/// What the assembler needs to know about the target model.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetProfile {
    pub model_id: ModelId,
    pub capabilities: CapabilitySet,
    pub ranges: ParameterRanges,
}

impl TargetProfile {
    pub fn new(model_id: ModelId, capabilities: CapabilitySet, ranges: ParameterRanges) -> Self {
        Self {
            model_id,
            capabilities,
            ranges,
        }
    }

    /// Profile as declared by a loaded adapter.
    pub fn from_adapter(model_id: ModelId, adapter: &dyn ModelAdapter) -> Self {
        Self::new(
            model_id,
            adapter.describe_capabilities(),
            adapter.parameter_ranges(),
        )
    }
}

/// Non-fatal adjustment made while assembling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssemblyWarning {
    HistoryTruncated { dropped_turns: usize },
    PassagesDropped { dropped: usize },
    RetrievalUnavailable { reason: String },
    ParameterClamped { name: String, requested: f64, applied: f64 },
    ContextOverflow { estimated_tokens: u32, context_window: u32 },
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HistoryTruncated { dropped_turns } => {
                write!(f, "history truncated: {dropped_turns} oldest turn(s) dropped")
            }
            Self::PassagesDropped { dropped } => {
                write!(f, "{dropped} retrieved passage(s) dropped to fit the context window")
            }
            Self::RetrievalUnavailable { reason } => {
                write!(f, "retrieval unavailable, answered without context: {reason}")
            }
            Self::ParameterClamped {
                name,
                requested,
                applied,
            } => write!(f, "parameter '{name}' clamped from {requested} to {applied}"),
            Self::ContextOverflow {
                estimated_tokens,
                context_window,
            } => write!(
                f,
                "pinned turns need ~{estimated_tokens} tokens, over the {context_window} token window"
            ),
        }
    }
}

/// Assembled request plus what was changed to produce it.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub request: GenerationRequest,
    pub warnings: Vec<AssemblyWarning>,
    pub estimated_tokens: u32,
}

/// Context assembler
#[derive(Clone)]
pub struct ContextAssembler {
    estimator: Arc<dyn TokenEstimator>,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(Arc::new(WordBasedEstimator))
    }
}

impl fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAssembler").finish_non_exhaustive()
    }
}

impl ContextAssembler {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Estimated size of a history without any truncation.
    pub fn estimate_history(&self, history: &[ConversationTurn]) -> u32 {
        self.estimator.estimate_turns(history)
    }

    pub fn build(
        &self,
        history: &[ConversationTurn],
        retrieved: &RetrievedContext,
        shaping: &ShapingParameters,
        stop: &[String],
        target: &TargetProfile,
    ) -> RelayResult<Assembly> {
        let last_user = history
            .iter()
            .rposition(|t| t.role == Role::User)
            .ok_or_else(|| {
                RelayError::InvalidRequest("conversation has no user turn".to_string())
            })?;

        let mut warnings = Vec::new();
        let window = target.capabilities.context_window;

        let mut passages = match retrieved {
            RetrievedContext::None => Vec::new(),
            RetrievedContext::Passages(p) => {
                let mut p = p.clone();
                p.sort_by(|a, b| b.score.total_cmp(&a.score));
                p
            }
            RetrievedContext::Unavailable(reason) => {
                warnings.push(AssemblyWarning::RetrievalUnavailable {
                    reason: reason.clone(),
                });
                Vec::new()
            }
        };

        let pinned = |i: usize, turn: &ConversationTurn| i == last_user || turn.role == Role::System;
        let mut kept: Vec<(usize, &ConversationTurn)> = history.iter().enumerate().collect();
        let mut context_tokens = self.context_block_tokens(&passages);
        let mut history_tokens: u32 = kept.iter().map(|(_, t)| self.estimator.estimate_turn(t)).sum();

        let mut dropped_turns = 0;
        while history_tokens + context_tokens > window {
            let Some(pos) = kept.iter().position(|(i, t)| !pinned(*i, *t)) else {
                break;
            };
            let (_, turn) = kept.remove(pos);
            history_tokens -= self.estimator.estimate_turn(turn);
            dropped_turns += 1;
        }
        if dropped_turns > 0 {
            warnings.push(AssemblyWarning::HistoryTruncated { dropped_turns });
        }

        let mut dropped_passages = 0;
        while history_tokens + context_tokens > window && !passages.is_empty() {
            passages.pop();
            context_tokens = self.context_block_tokens(&passages);
            dropped_passages += 1;
        }
        if dropped_passages > 0 {
            warnings.push(AssemblyWarning::PassagesDropped {
                dropped: dropped_passages,
            });
        }

        let estimated_tokens = history_tokens + context_tokens;
        if estimated_tokens > window {
            warnings.push(AssemblyWarning::ContextOverflow {
                estimated_tokens,
                context_window: window,
            });
        }

        let mut messages: Vec<ConversationTurn> = kept.into_iter().map(|(_, t)| t.clone()).collect();
        if let Some(block) = render_context_block(&passages) {
            let at = messages
                .iter()
                .position(|t| t.role != Role::System)
                .unwrap_or(messages.len());
            messages.insert(at, ConversationTurn::system(block));
        }

        let params = clamp_parameters(shaping, stop, &target.ranges, &mut warnings);

        for warning in &warnings {
            warn!(model = %target.model_id, %warning, "context assembly adjusted request");
        }
        debug!(
            model = %target.model_id,
            messages = messages.len(),
            estimated_tokens,
            window,
            "context assembled"
        );

        Ok(Assembly {
            request: GenerationRequest {
                model_id: target.model_id.clone(),
                messages,
                params,
                cancel: CancellationToken::new(),
            },
            warnings,
            estimated_tokens,
        })
    }

    fn context_block_tokens(&self, passages: &[RetrievedPassage]) -> u32 {
        render_context_block(passages)
            .map(|block| self.estimator.estimate_turn(&ConversationTurn::system(block)))
            .unwrap_or(0)
    }
}

fn render_context_block(passages: &[RetrievedPassage]) -> Option<String> {
    if passages.is_empty() {
        return None;
    }
    let mut block = String::from("<context>\n");
    for (i, passage) in passages.iter().enumerate() {
        block.push_str(&format!(
            "[{}] (source: {})\n{}\n",
            i + 1,
            passage.source_id,
            passage.text.trim()
        ));
    }
    block.push_str("</context>");
    Some(block)
}

fn clamp_parameters(
    shaping: &ShapingParameters,
    stop: &[String],
    ranges: &ParameterRanges,
    warnings: &mut Vec<AssemblyWarning>,
) -> GenerationParams {
    let mut clamp = |name: &str, requested: Option<f64>, range: &ParamRange| -> f64 {
        let Some(value) = requested else {
            return range.default;
        };
        let (applied, changed) = range.clamp(value);
        if changed {
            warnings.push(AssemblyWarning::ParameterClamped {
                name: name.to_string(),
                requested: value,
                applied,
            });
        }
        applied
    };

    let temperature = clamp(
        ShapingParameters::TEMPERATURE,
        shaping.get(ShapingParameters::TEMPERATURE),
        &ranges.temperature,
    );
    let top_p = clamp(
        ShapingParameters::TOP_P,
        shaping.get(ShapingParameters::TOP_P),
        &ranges.top_p,
    );
    let max_output_tokens = clamp(
        ShapingParameters::MAX_TOKENS,
        shaping.get(ShapingParameters::MAX_TOKENS),
        &ranges.max_output_tokens,
    )
    .round()
    .max(1.0) as u32;

    let mut influences = BTreeMap::new();
    for (name, value) in shaping.influences() {
        let applied = clamp(name, Some(value), ranges.influence_range(name));
        influences.insert(name.to_string(), applied);
    }

    GenerationParams {
        temperature,
        top_p,
        max_output_tokens,
        stop: stop.to_vec(),
        influences,
    }
}
