//! Reference backend adapters.
//!
//! - [`local`]: in-process engines loaded from weights on disk
//! - [`remote`]: OpenAI-compatible HTTP servers
//!
//! Both are plain [`relay_kernel::ModelAdapter`] implementations; the
//! orchestrator only sees the trait. [`validate_sequence`] guards the stream
//! contract for whatever adapter produced the output.

pub mod local;
pub mod remote;
mod sequence;

pub use local::{
    EngineError, EngineLoader, EngineSession, EngineStep, InferenceEngine, LocalWeightsAdapter,
    LocalWeightsFactory,
};
pub use remote::{RemoteHttpAdapter, RemoteHttpFactory};
pub use sequence::validate_sequence;
