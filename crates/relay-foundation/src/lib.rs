//! Relay foundation: the model orchestration core.
//!
//! ```text
//!  InboundRequest ─▶ GenerationOrchestrator ─▶ Router ─▶ ModelRegistry
//!                          │                              │ ensure_loaded
//!                          ├─▶ Retriever (optional)       ▼
//!                          ├─▶ ContextAssembler      AdapterFactory ─▶ ModelAdapter
//!                          ▼                                              │
//!                   GenerationHandle ◀──────────── ResponseChunk ◀────────┘
//! ```
//!
//! Contracts (`ModelAdapter`, `Retriever`, request/chunk types, errors) live
//! in `relay-kernel`; this crate provides the registry, router, context
//! assembler, orchestrator and the two reference adapters.

// registry module - model lifecycle, capacity and health
pub mod registry;
pub use registry::{
    AdapterHandle, HandleLease, HealthStatus, ModelRegistry, ModelSnapshot, RegistryConfig,
    RegistryEvent, RegistryHealth, SessionOutcome, SessionReport, UsageStats,
};

// router module - deterministic model selection
pub mod router;
pub use router::{RequestHint, RouteReason, Router, RouterDecision};

// context module - prompt assembly within the context window
pub mod context;
pub use context::{
    Assembly, AssemblyWarning, ContextAssembler, RetrievedContext, TargetProfile, TokenEstimator,
    WordBasedEstimator,
};

// reference adapters
pub mod adapters;

// orchestrator module - per-request driver
pub mod orchestrator;
pub use orchestrator::{
    AttemptRecord, Completion, Consensus, GenerationHandle, GenerationOrchestrator,
    OrchestratorConfig, RequestState, ScoredCompletion,
};

// config module
pub mod config;
pub use config::RelayConfig;
