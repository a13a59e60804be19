//! Router - deterministic model selection
//!
//! Given a registry snapshot, an optional explicit model id and the
//! capability tags a request needs, the router picks one model and an
//! ordered fallback list. The decision is a pure function of its inputs, so
//! the same snapshot and hint always produce the same decision.
//!
//! Automatic ranking is lexicographic:
//!
//! | Key | Preferred |
//! |-----|-----------|
//! | lifecycle state | Ready, then Loading, Registered, Failed |
//! | context window | fits the request's estimated tokens |
//! | last use | least recently used (never used first) |
//! | registration order | earlier |

use std::cmp::Ordering;
use std::fmt;

use relay_kernel::{CapabilityRequirements, ModelId, ModelState, RelayError, RelayResult};
use serde::Serialize;
use tracing::debug;

use crate::registry::{ModelRegistry, ModelSnapshot};

/// Why a model was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// The caller named the model.
    Explicit,
    /// Chosen among models declaring the required capabilities.
    CapabilityMatch,
    /// No requirements; chosen by readiness and recency.
    LoadBalance,
    /// A later candidate tried after an earlier one failed.
    Fallback,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Explicit => "explicit",
            Self::CapabilityMatch => "capability_match",
            Self::LoadBalance => "load_balance",
            Self::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Routing hint derived from the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHint {
    /// Exact model requested by the caller. Authoritative when set.
    pub model: Option<ModelId>,
    /// Estimated prompt size in tokens.
    pub estimated_tokens: u32,
}

impl RequestHint {
    pub fn new(model: Option<ModelId>, estimated_tokens: u32) -> Self {
        Self {
            model,
            estimated_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterDecision {
    pub model_id: ModelId,
    /// Candidates to try, in order, if the chosen model fails transiently.
    pub fallbacks: Vec<ModelId>,
    pub reason: RouteReason,
}

impl RouterDecision {
    /// Chosen model followed by the fallbacks.
    pub fn candidates(&self) -> impl Iterator<Item = &ModelId> {
        std::iter::once(&self.model_id).chain(self.fallbacks.iter())
    }

    /// Reason attached to the candidate at `index` in [`candidates`](Self::candidates).
    pub fn reason_for(&self, index: usize) -> RouteReason {
        if index == 0 {
            self.reason
        } else {
            RouteReason::Fallback
        }
    }
}

/// Model router over a [`ModelRegistry`].
#[derive(Debug, Clone)]
pub struct Router {
    registry: ModelRegistry,
}

impl Router {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    /// Select against the registry's current snapshot.
    pub fn select(
        &self,
        hint: &RequestHint,
        required: &CapabilityRequirements,
    ) -> RelayResult<RouterDecision> {
        let snapshots = self.registry.list_models();
        let decision = Self::select_from(&snapshots, self.registry.capacity_mb(), hint, required)?;
        debug!(
            model = %decision.model_id,
            fallbacks = decision.fallbacks.len(),
            reason = %decision.reason,
            "route selected"
        );
        Ok(decision)
    }

    /// Pure selection over a snapshot.
    pub fn select_from(
        snapshots: &[ModelSnapshot],
        capacity_mb: u64,
        hint: &RequestHint,
        required: &CapabilityRequirements,
    ) -> RelayResult<RouterDecision> {
        if let Some(model) = &hint.model {
            let snapshot = snapshots
                .iter()
                .find(|s| s.id() == model)
                .ok_or_else(|| RelayError::ModelNotFound(model.clone()))?;
            let missing = snapshot.descriptor.capabilities.missing(required);
            if !missing.is_empty() {
                let tags: Vec<&str> = missing.iter().map(|c| c.as_str()).collect();
                return Err(RelayError::CapabilityMismatch(format!(
                    "model '{model}' lacks [{}]",
                    tags.join(", ")
                )));
            }
            return Ok(RouterDecision {
                model_id: model.clone(),
                fallbacks: Vec::new(),
                reason: RouteReason::Explicit,
            });
        }

        let mut candidates: Vec<&ModelSnapshot> = snapshots
            .iter()
            .filter(|s| s.state.is_routable())
            .filter(|s| s.memory_mb() <= capacity_mb)
            .filter(|s| s.descriptor.capabilities.satisfies(required))
            .collect();

        if candidates.is_empty() {
            return Err(RelayError::CapabilityMismatch(if snapshots.is_empty() {
                "no models registered".to_string()
            } else {
                format!("no routable model satisfies {required}")
            }));
        }

        candidates.sort_by(|a, b| Self::rank(a, b, hint.estimated_tokens));

        let mut ids = candidates.into_iter().map(|s| s.id().clone());
        let model_id = ids
            .next()
            .ok_or_else(|| RelayError::CapabilityMismatch(format!("{required}")))?;
        Ok(RouterDecision {
            model_id,
            fallbacks: ids.collect(),
            reason: if required.is_empty() {
                RouteReason::LoadBalance
            } else {
                RouteReason::CapabilityMatch
            },
        })
    }

    fn rank(a: &ModelSnapshot, b: &ModelSnapshot, estimated_tokens: u32) -> Ordering {
        let key = |s: &ModelSnapshot| {
            (
                state_rank(s.state),
                s.descriptor.capabilities.context_window < estimated_tokens,
                s.last_used,
                s.registration_order,
            )
        };
        key(a).cmp(&key(b))
    }
}

fn state_rank(state: ModelState) -> u8 {
    match state {
        ModelState::Ready => 0,
        ModelState::Loading => 1,
        ModelState::Registered => 2,
        _ => 3,
    }
}
