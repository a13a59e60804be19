//! Consensus mode: ask several routable models the same question and keep
//! the answer scoring highest on a simple confidence heuristic.
//!
//! Every model is queried through the normal request path with an explicit
//! hint, so each answer is a complete, unmixed [`Completion`] and usage
//! statistics are recorded per model as usual.

use futures::future::join_all;
use relay_kernel::{InboundRequest, ModelId, RelayError, RelayResult};
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use super::{Completion, GenerationOrchestrator};
use crate::router::RequestHint;

/// Answers shorter than this many words lose confidence.
const SHORT_ANSWER_WORDS: usize = 10;
/// Answer lengths in this word range gain confidence.
const SUBSTANTIAL_ANSWER_WORDS: std::ops::RangeInclusive<usize> = 20..=500;
/// Word-count spread at which agreement reaches zero.
const AGREEMENT_SPREAD_WORDS: f64 = 100.0;

const HEDGES: [&str; 3] = ["i don't know", "i'm not sure", "unclear"];
const PRECISE: [&str; 3] = ["specifically", "precisely", "exactly"];

/// Heuristic confidence of a finished answer, in `[0, 1]`.
///
/// Starts at 0.5, rewards substantial answers, penalises very short or
/// hedging ones and rewards precise wording. `constrained` requests (with
/// capability requirements the serving model satisfied) gain 0.3.
pub fn answer_confidence(text: &str, constrained: bool) -> f64 {
    let mut confidence: f64 = 0.5;

    let words = text.split_whitespace().count();
    if SUBSTANTIAL_ANSWER_WORDS.contains(&words) {
        confidence += 0.2;
    } else if words < SHORT_ANSWER_WORDS {
        confidence -= 0.2;
    }

    if constrained {
        confidence += 0.3;
    }

    let lower = text.to_lowercase();
    if HEDGES.iter().any(|h| lower.contains(h)) {
        confidence -= 0.2;
    }
    if PRECISE.iter().any(|p| lower.contains(p)) {
        confidence += 0.1;
    }

    confidence.clamp(0.0, 1.0)
}

/// One model's answer within a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCompletion {
    pub model_id: ModelId,
    pub completion: Completion,
    /// `None` when the model did not finish successfully.
    pub confidence: Option<f64>,
}

/// Outcome of [`GenerationOrchestrator::consensus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consensus {
    /// Highest-confidence answer; ties go to the better-ranked model.
    pub best: ScoredCompletion,
    /// Every queried model in routing order, failures included.
    pub responses: Vec<ScoredCompletion>,
    /// Mean confidence over successful answers.
    pub overall_confidence: f64,
    /// 1.0 when successful answers have equal word counts, falling to 0.0
    /// as their spread reaches 100 words.
    pub agreement: f64,
}

impl Consensus {
    pub fn text(&self) -> &str {
        &self.best.completion.text
    }

    pub fn models_answered(&self) -> Vec<&ModelId> {
        self.responses
            .iter()
            .filter(|r| r.confidence.is_some())
            .map(|r| &r.model_id)
            .collect()
    }
}

impl GenerationOrchestrator {
    /// Query up to `consensus_models` routable models concurrently and keep
    /// the most confident answer.
    ///
    /// An explicit model hint restricts the round to that model. Fails with
    /// the routing error when no model qualifies, `Cancelled` when the
    /// caller cancelled, and `NoConsensus` when every model failed.
    pub async fn consensus(&self, request: InboundRequest) -> RelayResult<Consensus> {
        if request.last_user_text().is_none() {
            return Err(RelayError::InvalidRequest(
                "conversation has no user turn".to_string(),
            ));
        }
        let estimated_tokens = self.assembler.estimate_history(&request.conversation_history);
        let hint = RequestHint::new(request.model_hint.clone(), estimated_tokens);
        let decision = self.router.select(&hint, &request.required_capabilities)?;
        let models: Vec<ModelId> = decision
            .candidates()
            .take(self.config.consensus_models.max(1))
            .cloned()
            .collect();

        let span = info_span!("relay.consensus", models = models.len());
        let completions = join_all(models.iter().map(|model| {
            self.generate(request.clone().with_model_hint(model.clone()))
        }))
        .instrument(span)
        .await;

        let constrained = !request.required_capabilities.is_empty();
        let responses: Vec<ScoredCompletion> = models
            .into_iter()
            .zip(completions)
            .map(|(model_id, completion)| {
                let confidence = completion
                    .is_success()
                    .then(|| answer_confidence(&completion.text, constrained));
                if let Some(error) = &completion.error {
                    warn!(model = %model_id, error = %error, "consensus member failed");
                }
                ScoredCompletion {
                    model_id,
                    completion,
                    confidence,
                }
            })
            .collect();

        let mut best: Option<&ScoredCompletion> = None;
        for response in &responses {
            if let Some(score) = response.confidence {
                if best.and_then(|b| b.confidence).is_none_or(|top| score > top) {
                    best = Some(response);
                }
            }
        }
        let Some(best) = best.cloned() else {
            if request.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(RelayError::Cancelled);
            }
            let errors: Vec<String> = responses
                .iter()
                .map(|r| {
                    format!(
                        "{}: {}",
                        r.model_id,
                        r.completion.error.as_deref().unwrap_or("no answer")
                    )
                })
                .collect();
            return Err(RelayError::NoConsensus(errors.join("; ")));
        };

        let scores: Vec<f64> = responses.iter().filter_map(|r| r.confidence).collect();
        let overall_confidence = scores.iter().sum::<f64>() / scores.len() as f64;
        let lengths: Vec<usize> = responses
            .iter()
            .filter(|r| r.confidence.is_some())
            .map(|r| r.completion.text.split_whitespace().count())
            .collect();
        let longest = lengths.iter().max().copied().unwrap_or(0);
        let shortest = lengths.iter().min().copied().unwrap_or(0);
        let spread = longest - shortest;
        let agreement = 1.0 - (spread as f64 / AGREEMENT_SPREAD_WORDS).min(1.0);

        info!(
            best = %best.model_id,
            answered = scores.len(),
            queried = responses.len(),
            overall_confidence,
            agreement,
            "consensus reached"
        );
        Ok(Consensus {
            best,
            responses,
            overall_confidence,
            agreement,
        })
    }
}
