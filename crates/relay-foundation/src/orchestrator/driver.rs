//! Per-request driver: route, retrieve, then walk the candidate list until
//! one adapter finishes, relaying its chunks as they arrive.

use std::time::{Duration, Instant};

use futures::StreamExt;
use relay_kernel::{
    AdapterError, FinishReason, GenerationRequest, InboundRequest, ModelId, RelayError,
    ResponseChunk, RetrievalError,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::GenerationOrchestrator;
use super::consensus::answer_confidence;
use super::session::{AttemptLog, AttemptRecord};
use super::state::RequestState;
use crate::adapters::validate_sequence;
use crate::context::{RetrievedContext, TargetProfile};
use crate::registry::{HandleLease, SessionOutcome, SessionReport};
use crate::router::RequestHint;

/// How the whole request ended.
enum Outcome {
    Finished { reason: FinishReason, model: ModelId },
    Cancelled,
    Failed(RelayError),
}

/// How one candidate attempt ended.
enum AttemptEnd {
    Finished(FinishReason),
    Cancelled,
    Failed(RelayError),
}

pub(crate) struct Driver {
    orchestrator: GenerationOrchestrator,
    cancel: CancellationToken,
    tx: mpsc::Sender<ResponseChunk>,
    state: watch::Sender<RequestState>,
    attempts: AttemptLog,
    /// Next sequence number handed to the caller.
    sequence: u64,
    /// Whether any text reached the caller.
    relayed: bool,
    /// Text relayed by the current attempt.
    attempt_text: String,
    serving: Option<ModelId>,
    fallback_notes: Vec<String>,
    assembly_warnings: Vec<String>,
}

impl Driver {
    pub(crate) fn new(
        orchestrator: GenerationOrchestrator,
        cancel: CancellationToken,
        tx: mpsc::Sender<ResponseChunk>,
        state: watch::Sender<RequestState>,
        attempts: AttemptLog,
    ) -> Self {
        Self {
            orchestrator,
            cancel,
            tx,
            state,
            attempts,
            sequence: 0,
            relayed: false,
            attempt_text: String::new(),
            serving: None,
            fallback_notes: Vec::new(),
            assembly_warnings: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, request: InboundRequest) {
        let outcome = self.drive(&request).await;
        self.finish(outcome).await;
    }

    async fn drive(&mut self, request: &InboundRequest) -> Outcome {
        let orch = self.orchestrator.clone();

        if request.last_user_text().is_none() {
            return Outcome::Failed(RelayError::InvalidRequest(
                "conversation has no user turn".to_string(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let estimated_tokens = orch.assembler.estimate_history(&request.conversation_history);
        let hint = RequestHint::new(request.model_hint.clone(), estimated_tokens);
        let decision = match orch.router.select(&hint, &request.required_capabilities) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "routing failed");
                return Outcome::Failed(err);
            }
        };
        self.set_state(RequestState::Routed);
        info!(
            model = %decision.model_id,
            fallbacks = decision.fallbacks.len(),
            reason = %decision.reason,
            estimated_tokens,
            "request routed"
        );

        let Some(retrieved) = self.retrieve(&orch, request).await else {
            return Outcome::Cancelled;
        };

        let limit = 1 + orch.config.max_fallback_attempts;
        let mut last_failure: Option<(ModelId, RelayError)> = None;

        for (index, model) in decision.candidates().take(limit).enumerate() {
            if let Some((failed, err)) = &last_failure {
                info!(from = %failed, to = %model, error = %err, "falling back");
                self.fallback_notes
                    .push(format!("model '{failed}' failed ({err}); fell back to '{model}'"));
            }

            let mut record = AttemptRecord {
                model_id: model.clone(),
                reason: decision.reason_for(index),
                relayed_chunks: 0,
                error: None,
            };
            let span = info_span!("relay.attempt", model = %model, attempt = index);
            let end = self
                .attempt(&orch, model, request, &retrieved, &mut record)
                .instrument(span)
                .await;
            if let AttemptEnd::Failed(err) = &end {
                record.error = Some(err.to_string());
            }
            self.attempts.lock().push(record);

            match end {
                AttemptEnd::Finished(reason) => {
                    return Outcome::Finished {
                        reason,
                        model: model.clone(),
                    };
                }
                AttemptEnd::Cancelled | AttemptEnd::Failed(RelayError::Cancelled) => {
                    return Outcome::Cancelled;
                }
                AttemptEnd::Failed(err) => {
                    // partial output is never mixed with another model's
                    if self.relayed || err.is_unsatisfiable() {
                        return Outcome::Failed(err);
                    }
                    warn!(model = %model, error = %err, "attempt failed before output");
                    last_failure = Some((model.clone(), err));
                }
            }
        }

        Outcome::Failed(match last_failure {
            Some((_, err)) => err,
            None => RelayError::CapabilityMismatch("no candidate models".to_string()),
        })
    }

    /// Passages for the request, or `None` when cancelled while waiting.
    async fn retrieve(
        &self,
        orch: &GenerationOrchestrator,
        request: &InboundRequest,
    ) -> Option<RetrievedContext> {
        let Some(retriever) = orch.retriever.clone() else {
            return Some(RetrievedContext::None);
        };
        let query = request.last_user_text().unwrap_or_default();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = retriever.lookup(query, orch.config.retrieval_top_k) => result,
        };
        Some(match result {
            Ok(passages) => {
                debug!(passages = passages.len(), "retrieval complete");
                RetrievedContext::Passages(passages)
            }
            Err(err) => {
                warn!(error = %err, "retrieval unavailable, continuing without context");
                RetrievedContext::Unavailable(match err {
                    RetrievalError::Unavailable(reason) => reason,
                    other => other.to_string(),
                })
            }
        })
    }

    async fn attempt(
        &mut self,
        orch: &GenerationOrchestrator,
        model: &ModelId,
        request: &InboundRequest,
        retrieved: &RetrievedContext,
        record: &mut AttemptRecord,
    ) -> AttemptEnd {
        let lease = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptEnd::Cancelled,
            lease = orch.registry.ensure_loaded(model) => lease,
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(err) => return AttemptEnd::Failed(err),
        };
        self.serving = Some(model.clone());

        let profile = TargetProfile::from_adapter(model.clone(), &**lease.adapter());
        let assembly = match orch.assembler.build(
            &request.conversation_history,
            retrieved,
            &request.shaping_parameters,
            &request.stop,
            &profile,
        ) {
            Ok(assembly) => assembly,
            Err(err) => return AttemptEnd::Failed(err),
        };
        self.assembly_warnings = assembly.warnings.iter().map(ToString::to_string).collect();
        self.set_state(RequestState::ContextBuilt);

        let started = Instant::now();
        let mut report = SessionReport {
            outcome: SessionOutcome::Failed,
            chunks: 0,
            bytes: 0,
            duration: Duration::ZERO,
            confidence: None,
        };
        self.attempt_text.clear();
        let end = self
            .stream(orch, model, &lease, assembly.request, record, &mut report)
            .await;
        report.outcome = match &end {
            AttemptEnd::Finished(_) => {
                report.confidence = Some(answer_confidence(
                    &self.attempt_text,
                    !request.required_capabilities.is_empty(),
                ));
                SessionOutcome::Completed
            }
            AttemptEnd::Cancelled => SessionOutcome::Cancelled,
            AttemptEnd::Failed(_) => SessionOutcome::Failed,
        };
        report.duration = started.elapsed();
        orch.registry.record_session(model, report);
        end
    }

    async fn stream(
        &mut self,
        orch: &GenerationOrchestrator,
        model: &ModelId,
        lease: &HandleLease,
        request: GenerationRequest,
        record: &mut AttemptRecord,
        report: &mut SessionReport,
    ) -> AttemptEnd {
        let adapter = lease.adapter().clone();
        let request = request.with_cancel(self.cancel.child_token());

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptEnd::Cancelled,
            opened = adapter.generate(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => validate_sequence(model.clone(), stream),
            Err(err) => return self.adapter_failure(orch, model, err),
        };
        self.set_state(RequestState::Streaming);
        debug!(
            adapter = adapter.name(),
            streaming = adapter.supports_streaming(),
            "adapter stream opened"
        );

        let revoked = lease.revoked();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptEnd::Cancelled,
                _ = revoked.cancelled() => {
                    warn!(model = %model, "handle revoked mid-stream");
                    return AttemptEnd::Failed(RelayError::Fatal {
                        model: model.clone(),
                        message: "model was marked degraded during generation".to_string(),
                    });
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if !chunk.text.is_empty() {
                        report.chunks += 1;
                        report.bytes += chunk.text.len() as u64;
                        if !self.relay(chunk.text, model).await {
                            return AttemptEnd::Cancelled;
                        }
                        record.relayed_chunks += 1;
                    }
                    match chunk.finish {
                        None => {}
                        Some(FinishReason::Cancelled) => return AttemptEnd::Cancelled,
                        Some(FinishReason::Error) => {
                            return self.adapter_failure(
                                orch,
                                model,
                                AdapterError::fatal("adapter finished with an error"),
                            );
                        }
                        Some(reason) => return AttemptEnd::Finished(reason),
                    }
                }
                Some(Err(err)) => return self.adapter_failure(orch, model, err),
                None => {
                    return self.adapter_failure(
                        orch,
                        model,
                        AdapterError::fatal("adapter stream ended unexpectedly"),
                    );
                }
            }
        }
    }

    /// Classify an adapter error. Fatal errors degrade the model before any
    /// fallback is attempted.
    fn adapter_failure(
        &self,
        orch: &GenerationOrchestrator,
        model: &ModelId,
        err: AdapterError,
    ) -> AttemptEnd {
        if matches!(err, AdapterError::Cancelled) {
            return AttemptEnd::Cancelled;
        }
        let err = RelayError::from_adapter(model, err);
        if err.is_fatal() {
            warn!(model = %model, error = %err, "fatal adapter error, degrading model");
            if let Err(mark_err) = orch.registry.mark_degraded(model, err.to_string()) {
                warn!(model = %model, error = %mark_err, "failed to mark model degraded");
            }
        }
        AttemptEnd::Failed(err)
    }

    /// Forward one text delta. Returns `false` if the caller went away.
    async fn relay(&mut self, text: String, model: &ModelId) -> bool {
        self.attempt_text.push_str(&text);
        let chunk = ResponseChunk::delta(self.sequence, text, Some(model.clone()));
        trace!(sequence = self.sequence, bytes = chunk.text_delta.len(), "relaying chunk");
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(chunk) => sent.is_ok(),
        };
        if sent {
            self.sequence += 1;
            self.relayed = true;
        }
        sent
    }

    async fn finish(&mut self, outcome: Outcome) {
        let (mut chunk, state) = match outcome {
            Outcome::Finished { reason, model } => {
                let mut chunk = ResponseChunk::terminal(self.sequence, reason);
                chunk.model_id = Some(model);
                (chunk, RequestState::Completed)
            }
            Outcome::Cancelled => (
                ResponseChunk::terminal(self.sequence, FinishReason::Cancelled),
                RequestState::Cancelled,
            ),
            Outcome::Failed(err) => {
                let mut chunk = ResponseChunk::terminal(self.sequence, FinishReason::Error);
                chunk.error = Some(err.to_string());
                chunk.incomplete = self.relayed;
                (chunk, RequestState::Failed)
            }
        };
        if chunk.model_id.is_none() {
            chunk.model_id = self.serving.clone();
        }
        chunk.warnings = std::mem::take(&mut self.assembly_warnings);
        chunk.warnings.append(&mut self.fallback_notes);

        info!(
            state = %state,
            model = ?chunk.model_id,
            chunks = self.sequence,
            incomplete = chunk.incomplete,
            "request finished"
        );
        // state first: a caller waiting on `finished()` must not block the send
        self.set_state(state);
        let _ = self.tx.send(chunk).await;
    }

    fn set_state(&self, state: RequestState) {
        debug!(state = %state, "request state");
        self.state.send_replace(state);
    }
}
