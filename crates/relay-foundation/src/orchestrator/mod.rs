//! Generation Orchestrator - end-to-end request driver
//!
//! ```text
//! InboundRequest
//!      │ submit()
//!      ▼
//! ┌──────────┐  route   ┌──────────┐ retrieve ┌───────────┐
//! │ Pending  │ ───────▶ │  Routed  │ ───────▶ │ candidate │◀──────────────┐
//! └──────────┘          └──────────┘          │   loop    │               │
//!                                             └─────┬─────┘               │
//!                        ensure_loaded + assemble   │                     │
//!                                                   ▼                     │
//!                                            ┌──────────────┐             │
//!                                            │ ContextBuilt │             │
//!                                            └──────┬───────┘             │
//!                                     generate      ▼        failure with │
//!                                            ┌──────────────┐ no output   │
//!                                            │  Streaming   │ ────────────┘
//!                                            └──────┬───────┘
//!                                                   ▼
//!                                  Completed | Failed | Cancelled
//! ```
//!
//! Each request runs on its own task and relays chunks through a bounded
//! channel to its [`GenerationHandle`]. Every request ends with exactly one
//! terminal chunk. Fallback to the next candidate happens only while nothing
//! from the current attempt has reached the caller; once output was relayed a
//! failure ends the request with `incomplete` set.

mod consensus;
mod driver;
mod session;
mod state;

pub use consensus::{Consensus, ScoredCompletion, answer_confidence};
pub use session::{AttemptRecord, GenerationHandle};
pub use state::RequestState;

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use relay_kernel::{FinishReason, InboundRequest, ModelId, ResponseChunk, Retriever};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::context::ContextAssembler;
use crate::registry::ModelRegistry;
use crate::router::Router;
use driver::Driver;

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fallback candidates tried after the first model fails
    pub max_fallback_attempts: usize,
    /// Passages requested from the retriever
    pub retrieval_top_k: usize,
    /// Chunks buffered between the driver and the caller
    pub relay_buffer: usize,
    /// Models queried by a consensus round
    pub consensus_models: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_fallback_attempts: 2,
            retrieval_top_k: 4,
            relay_buffer: 1,
            consensus_models: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_fallback_attempts(mut self, attempts: usize) -> Self {
        self.max_fallback_attempts = attempts;
        self
    }

    pub fn with_retrieval_top_k(mut self, k: usize) -> Self {
        self.retrieval_top_k = k;
        self
    }

    pub fn with_relay_buffer(mut self, chunks: usize) -> Self {
        self.relay_buffer = chunks;
        self
    }

    pub fn with_consensus_models(mut self, models: usize) -> Self {
        self.consensus_models = models;
        self
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Drained result of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub session_id: Uuid,
    pub text: String,
    pub finish_reason: FinishReason,
    /// Model that served (or last attempted) the request.
    pub model_id: Option<ModelId>,
    /// Text chunks received.
    pub chunks: u64,
    pub incomplete: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    pub fallback_used: bool,
    /// First candidate, when a fallback served the request.
    pub original_model: Option<ModelId>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self.finish_reason, FinishReason::Stop | FinishReason::Length)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives requests through routing, context assembly and generation.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    registry: ModelRegistry,
    router: Router,
    assembler: ContextAssembler,
    retriever: Option<Arc<dyn Retriever>>,
    config: OrchestratorConfig,
}

impl GenerationOrchestrator {
    pub fn new(registry: ModelRegistry, config: OrchestratorConfig) -> Self {
        Self {
            router: Router::new(registry.clone()),
            registry,
            assembler: ContextAssembler::default(),
            retriever: None,
            config,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a request. Must be called within a tokio runtime.
    pub fn submit(&self, mut request: InboundRequest) -> GenerationHandle {
        let session_id = Uuid::new_v4();
        let cancel = request
            .cancel
            .take()
            .map(|caller| caller.child_token())
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(self.config.relay_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(RequestState::Pending);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let span = info_span!(
            "relay.generate",
            session_id = %session_id,
            model_hint = ?request.model_hint,
            turns = request.conversation_history.len()
        );
        let driver = Driver::new(self.clone(), cancel.clone(), tx, state_tx, attempts.clone());
        tokio::spawn(driver.run(request).instrument(span));

        GenerationHandle::new(
            session_id,
            cancel,
            state_rx,
            attempts,
            ReceiverStream::new(rx),
        )
    }

    /// Run a request to completion and aggregate its chunks.
    pub async fn generate(&self, request: InboundRequest) -> Completion {
        let mut handle = self.submit(request);
        let session_id = handle.session_id();

        let mut text = String::new();
        let mut chunks = 0u64;
        let mut terminal: Option<ResponseChunk> = None;
        while let Some(chunk) = handle.next().await {
            if chunk.done {
                terminal = Some(chunk);
                break;
            }
            text.push_str(&chunk.text_delta);
            chunks += 1;
        }
        let terminal = terminal.unwrap_or_else(|| {
            let mut chunk = ResponseChunk::terminal(chunks, FinishReason::Error);
            chunk.error = Some("session ended without a terminal chunk".to_string());
            chunk.incomplete = chunks > 0;
            chunk
        });

        let attempts = handle.attempts();
        let fallback_used = attempts.len() > 1;
        let original_model = if fallback_used {
            attempts.first().map(|a| a.model_id.clone())
        } else {
            None
        };

        Completion {
            session_id,
            text,
            finish_reason: terminal.finish_reason.unwrap_or(FinishReason::Error),
            model_id: terminal.model_id,
            chunks,
            incomplete: terminal.incomplete,
            error: terminal.error,
            warnings: terminal.warnings,
            attempts,
            fallback_used,
            original_model,
        }
    }
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("registry", &self.registry)
            .field("retriever", &self.retriever.is_some())
            .field("config", &self.config)
            .finish()
    }
}
