//! Local-weights adapter.
//!
//! Wraps an in-process inference engine. Engines are synchronous: loading
//! weights and stepping the decoder both block, so the adapter runs them on
//! tokio's blocking pool and bridges output back through a bounded channel.
//!
//! ```text
//! generate() ──spawn_blocking──▶ engine.start() ──▶ EngineSession
//!                                                      │ step()
//!      ChunkStream ◀── ReceiverStream ◀── mpsc ◀───────┘
//! ```
//!
//! The decode loop checks the request's cancellation token and the channel
//! before every step, so dropping the stream or cancelling stops the engine
//! within one token.

use std::sync::Arc;

use async_trait::async_trait;
use relay_kernel::{
    AdapterChunk, AdapterError, AdapterFactory, Capability, CapabilitySet, ChunkStream,
    ConversationTurn, FinishReason, GenerationParams, GenerationRequest, ModelAdapter,
    ModelDescriptor, ModelFamily, ModelId, ParameterRanges,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Channel depth between the decode thread and the async side.
const DECODE_CHANNEL_CAPACITY: usize = 32;

/// Setting key overriding the adapter's maximum output tokens.
pub const MAX_OUTPUT_TOKENS_SETTING: &str = "max_output_tokens";

// ============================================================================
// Engine seam
// ============================================================================

/// Engine failures, classified for the adapter contract.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Temporarily unable to serve (queue full, device busy).
    #[error("engine busy: {0}")]
    Busy(String),

    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    /// Weights missing or corrupt.
    #[error("weights unusable: {0}")]
    Weights(String),

    #[error("inference failed: {0}")]
    Failed(String),
}

impl From<EngineError> for AdapterError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Busy(_) | EngineError::OutOfMemory(_) => {
                AdapterError::transient(err.to_string())
            }
            EngineError::Weights(_) | EngineError::Failed(_) => AdapterError::fatal(err.to_string()),
        }
    }
}

/// One decoder step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStep {
    Token(String),
    Finished(FinishReason),
}

/// In-flight decode state. Dropped when the generation ends.
pub trait EngineSession: Send {
    fn step(&mut self) -> Result<EngineStep, EngineError>;
}

/// Loaded weights able to start decode sessions.
pub trait InferenceEngine: Send + Sync {
    fn start(
        &self,
        messages: &[ConversationTurn],
        params: &GenerationParams,
    ) -> Result<Box<dyn EngineSession>, EngineError>;

    /// Free device memory. Called once on unload.
    fn release(&self) {}
}

/// Reads weights for a descriptor. Runs on the blocking pool.
pub trait EngineLoader: Send + Sync {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn InferenceEngine>, EngineError>;
}

// ============================================================================
// Adapter
// ============================================================================

pub struct LocalWeightsAdapter {
    model_id: ModelId,
    engine: Arc<dyn InferenceEngine>,
    capabilities: CapabilitySet,
    ranges: ParameterRanges,
}

impl LocalWeightsAdapter {
    pub fn new(descriptor: &ModelDescriptor, engine: Arc<dyn InferenceEngine>) -> Self {
        let mut ranges = ParameterRanges::default();
        if let Some(max) = descriptor
            .setting(MAX_OUTPUT_TOKENS_SETTING)
            .and_then(|v| v.parse::<u32>().ok())
        {
            ranges = ranges.with_max_output_tokens(max);
        }
        Self {
            model_id: descriptor.id.clone(),
            engine,
            capabilities: descriptor.capabilities.clone(),
            ranges,
        }
    }
}

#[async_trait]
impl ModelAdapter for LocalWeightsAdapter {
    fn name(&self) -> &str {
        "local-weights"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream, AdapterError> {
        if request.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let engine = self.engine.clone();
        let messages = request.messages;
        let params = request.params;
        let (session, params) = tokio::task::spawn_blocking(move || {
            engine.start(&messages, &params).map(|s| (s, params))
        })
        .await
        .map_err(|e| AdapterError::fatal(format!("engine start panicked: {e}")))??;

        debug!(model = %self.model_id, streaming = self.supports_streaming(), "decode started");

        let (tx, rx) = mpsc::channel(DECODE_CHANNEL_CAPACITY);
        let decoder = Decoder {
            session,
            params,
            cancel: request.cancel,
            streaming: self.supports_streaming(),
            tx,
        };
        tokio::task::spawn_blocking(move || decoder.run());

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn supports_streaming(&self) -> bool {
        self.capabilities.has(&Capability::Streaming)
    }

    fn describe_capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn parameter_ranges(&self) -> ParameterRanges {
        self.ranges.clone()
    }

    async fn shutdown(&self) {
        let engine = self.engine.clone();
        let _ = tokio::task::spawn_blocking(move || engine.release()).await;
        info!(model = %self.model_id, "local engine released");
    }
}

struct Decoder {
    session: Box<dyn EngineSession>,
    params: GenerationParams,
    cancel: CancellationToken,
    streaming: bool,
    tx: mpsc::Sender<Result<AdapterChunk, AdapterError>>,
}

impl Decoder {
    fn run(mut self) {
        let mut sequence = 0u64;
        let mut output = String::new();
        let mut emitted = 0usize;
        let mut produced = 0u32;

        let finish = loop {
            if self.cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if self.tx.is_closed() {
                return;
            }
            if produced >= self.params.max_output_tokens {
                break FinishReason::Length;
            }

            match self.session.step() {
                Ok(EngineStep::Token(token)) => {
                    produced += 1;
                    output.push_str(&token);
                    if let Some(cut) = find_stop(&output, &self.params.stop) {
                        output.truncate(cut);
                        break FinishReason::Stop;
                    }
                    let safe = output.len() - held_back(&output, &self.params.stop);
                    if self.streaming && safe > emitted {
                        if !self.send(AdapterChunk::text(sequence, &output[emitted..safe])) {
                            return;
                        }
                        sequence += 1;
                        emitted = safe;
                    }
                }
                Ok(EngineStep::Finished(reason)) => break reason,
                Err(err) => {
                    let _ = self.tx.blocking_send(Err(err.into()));
                    return;
                }
            }
        };

        if output.len() > emitted {
            if !self.send(AdapterChunk::text(sequence, &output[emitted..])) {
                return;
            }
            sequence += 1;
        }
        let _ = self.send(AdapterChunk::finish(sequence, finish));
    }

    fn send(&self, chunk: AdapterChunk) -> bool {
        self.tx.blocking_send(Ok(chunk)).is_ok()
    }
}

/// Byte offset of the earliest stop sequence in `output`.
fn find_stop(output: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| output.find(s.as_str()))
        .min()
}

/// Length of the longest suffix of `output` that could still grow into a
/// stop sequence. That suffix is withheld from streaming until resolved.
fn held_back(output: &str, stops: &[String]) -> usize {
    let longest = stops.iter().map(String::len).max().unwrap_or(0);
    if longest == 0 {
        return 0;
    }
    let floor = output.len().saturating_sub(longest - 1);
    output
        .char_indices()
        .map(|(i, _)| i)
        .filter(|&i| i >= floor)
        .find(|&i| stops.iter().any(|s| s.starts_with(&output[i..])))
        .map(|i| output.len() - i)
        .unwrap_or(0)
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`LocalWeightsAdapter`]s through an [`EngineLoader`].
pub struct LocalWeightsFactory {
    loader: Arc<dyn EngineLoader>,
}

impl LocalWeightsFactory {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl AdapterFactory for LocalWeightsFactory {
    fn family(&self) -> ModelFamily {
        ModelFamily::LocalWeights
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        let loader = self.loader.clone();
        let owned = descriptor.clone();
        let engine = tokio::task::spawn_blocking(move || loader.load(&owned))
            .await
            .map_err(|e| AdapterError::fatal(format!("weight loader panicked: {e}")))??;
        Ok(Arc::new(LocalWeightsAdapter::new(descriptor, engine)))
    }
}
