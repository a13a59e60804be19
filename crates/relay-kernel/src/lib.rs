//! Relay kernel: the stable contracts of the model orchestration core.
//!
//! Everything an engine integration or an embedding application needs to
//! agree on lives here: model declarations and lifecycle states, the
//! generation request/chunk types, the [`adapter::ModelAdapter`] and
//! [`retrieval::Retriever`] traits, and the error taxonomy. Implementations
//! live in `relay-foundation`.

// error module
pub mod error;
pub use error::{AdapterError, IntoRelayReport, RelayError, RelayReport, RelayResult};

// model declarations and lifecycle
pub mod model;
pub use model::*;

// request and chunk types
pub mod generation;
pub use generation::*;

// backend adapter contract
pub mod adapter;
pub use adapter::{AdapterFactory, ChunkStream, ModelAdapter};

// retrieval collaborator
pub mod retrieval;
pub use retrieval::{RetrievalError, Retriever};

// Global Configuration System
#[cfg(feature = "config")]
pub mod config;
