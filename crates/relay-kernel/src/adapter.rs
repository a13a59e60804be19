//! Backend adapter contract.
//!
//! An adapter wraps one concrete generation engine behind a
//! capability-described interface. New engine families are added by
//! implementing [`ModelAdapter`] and an [`AdapterFactory`] that builds it from
//! a [`ModelDescriptor`]; the orchestrator never branches on engine type.
//!
//! # Stream contract
//!
//! [`ModelAdapter::generate`] returns a finite [`ChunkStream`]:
//!
//! - sequence numbers start at 0 and increase by one per chunk;
//! - at most one chunk carries a finish reason, and it is the last item;
//! - the stream is not restartable, a new request must be issued;
//! - dropping the stream or cancelling the request token must release every
//!   engine-side resource the call acquired.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::AdapterError;
use crate::generation::{AdapterChunk, GenerationRequest, ParameterRanges};
use crate::model::{CapabilitySet, ModelDescriptor, ModelFamily};

/// Blanket trait for `Stream<Item = Result<AdapterChunk, AdapterError>> + Send`
pub trait AdapterChunkStream: Stream<Item = Result<AdapterChunk, AdapterError>> + Send {}
impl<T> AdapterChunkStream for T where T: Stream<Item = Result<AdapterChunk, AdapterError>> + Send {}

/// Type erased adapter output
pub type ChunkStream = Pin<Box<dyn AdapterChunkStream>>;

/// Uniform interface over one loaded generation engine.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Short adapter name used in logs.
    fn name(&self) -> &str;

    /// Start a generation. Errors returned here happen before any output.
    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream, AdapterError>;

    /// Whether output arrives incrementally. Non-streaming adapters yield a
    /// single text chunk followed by the finish chunk.
    fn supports_streaming(&self) -> bool;

    fn describe_capabilities(&self) -> CapabilitySet;

    /// Valid ranges for shaping parameters.
    fn parameter_ranges(&self) -> ParameterRanges {
        ParameterRanges::default()
    }

    /// Release engine resources. Called once by the registry on unload.
    async fn shutdown(&self) {}
}

/// Constructs adapters for one model family. Calling [`load`](Self::load) is
/// the expensive "load" step the registry serializes per model.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn family(&self) -> ModelFamily;

    async fn load(&self, descriptor: &ModelDescriptor)
    -> Result<Arc<dyn ModelAdapter>, AdapterError>;
}
