//! Error taxonomy for the orchestration core.
//!
//! Two layers:
//!
//! - [`AdapterError`] is what a backend adapter reports. It carries only the
//!   retry classification an adapter is able to judge on its own.
//! - [`RelayError`] is what callers of the registry, router and orchestrator
//!   see. It is `Clone` so a single load outcome can be handed to every caller
//!   waiting on the same model.
//!
//! Configuration loading additionally uses [`error_stack::Report`] (see
//! [`RelayReport`]) so the failing file and stage travel with the error.

use error_stack::Report;
use thiserror::Error;

use crate::model::ModelId;

/// Classified failure reported by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// Safe to retry on the same or a fallback model.
    #[error("Transient adapter error: {0}")]
    Transient(String),

    /// Not retryable on this model; the model is marked degraded.
    #[error("Fatal adapter error: {0}")]
    Fatal(String),

    /// Caller-initiated; never logged as a failure.
    #[error("Generation cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Crate-level error type shared by every component of the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RelayError {
    /// No model is registered under the id.
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),

    /// The model (or every model) lacks a required capability.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// A load would push committed memory past the configured capacity.
    #[error(
        "Capacity exceeded: model '{model}' needs {requested_mb} MB, {committed_mb}/{capacity_mb} MB committed"
    )]
    CapacityExceeded {
        model: ModelId,
        requested_mb: u64,
        committed_mb: u64,
        capacity_mb: u64,
    },

    /// Adapter construction failed.
    #[error("Failed to load model '{model}': {reason}")]
    LoadError { model: ModelId, reason: String },

    /// Retryable adapter-level failure.
    #[error("Transient error on model '{model}': {message}")]
    Transient { model: ModelId, message: String },

    /// Adapter-level failure that is not retryable on the model.
    #[error("Fatal error on model '{model}': {message}")]
    Fatal { model: ModelId, message: String },

    /// The retrieval collaborator could not answer; generation proceeds without context.
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid model descriptor: {0}")]
    InvalidDescriptor(String),

    /// A different descriptor is already registered under the id.
    #[error("Model '{0}' is already registered with a different descriptor")]
    RegistrationConflict(ModelId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Every model asked for a consensus answer failed.
    #[error("No consensus: {0}")]
    NoConsensus(String),
}

impl RelayError {
    /// Attach a model id to an adapter failure.
    pub fn from_adapter(model: &ModelId, error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(message) => Self::Transient {
                model: model.clone(),
                message,
            },
            AdapterError::Fatal(message) => Self::Fatal {
                model: model.clone(),
                message,
            },
            AdapterError::Cancelled => Self::Cancelled,
        }
    }

    /// Errors that reflect an unsatisfiable request rather than a fault.
    pub fn is_unsatisfiable(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::CapabilityMismatch(_)
                | Self::CapacityExceeded { .. }
                | Self::InvalidRequest(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Short machine-readable code, used in terminal response chunks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "model_not_found",
            Self::CapabilityMismatch(_) => "capability_mismatch",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::LoadError { .. } => "load_error",
            Self::Transient { .. } => "transient_error",
            Self::Fatal { .. } => "fatal_error",
            Self::RetrievalUnavailable(_) => "retrieval_unavailable",
            Self::Cancelled => "cancelled",
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::RegistrationConflict(_) => "registration_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config_error",
            Self::NoConsensus(_) => "no_consensus",
        }
    }
}

#[cfg(feature = "config")]
impl From<crate::config::ConfigError> for RelayError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Plain result alias for core operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Error-stack–backed result alias, used where context attachments matter.
///
/// Equivalent to `Result<T, error_stack::Report<RelayError>>`.
pub type RelayReport<T> = ::std::result::Result<T, Report<RelayError>>;

/// Extension trait to convert [`RelayResult<T>`] into [`RelayReport<T>`].
pub trait IntoRelayReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> RelayReport<T>;
}

impl<T> IntoRelayReport<T> for RelayResult<T> {
    #[inline]
    fn into_report(self) -> RelayReport<T> {
        self.map_err(Report::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::ResultExt;

    #[test]
    fn adapter_error_keeps_classification() {
        let model = ModelId::new("m1");

        let transient = RelayError::from_adapter(&model, AdapterError::transient("reset"));
        assert!(transient.is_transient());
        assert!(transient.to_string().contains("m1"));

        let fatal = RelayError::from_adapter(&model, AdapterError::fatal("bad weights"));
        assert!(fatal.is_fatal());

        let cancelled = RelayError::from_adapter(&model, AdapterError::Cancelled);
        assert_eq!(cancelled, RelayError::Cancelled);
    }

    #[test]
    fn unsatisfiable_errors_are_not_retryable() {
        assert!(RelayError::ModelNotFound("x".into()).is_unsatisfiable());
        assert!(RelayError::CapabilityMismatch("streaming".into()).is_unsatisfiable());
        assert!(
            RelayError::CapacityExceeded {
                model: "m2".into(),
                requested_mb: 10,
                committed_mb: 10,
                capacity_mb: 10,
            }
            .is_unsatisfiable()
        );
        assert!(
            !RelayError::Transient {
                model: "m".into(),
                message: "x".into()
            }
            .is_unsatisfiable()
        );
    }

    #[test]
    fn codes_are_snake_case() {
        assert_eq!(RelayError::Cancelled.code(), "cancelled");
        assert_eq!(
            RelayError::RetrievalUnavailable("down".into()).code(),
            "retrieval_unavailable"
        );
    }

    #[test]
    fn report_carries_context() {
        let result: RelayResult<()> = Err(RelayError::Config("missing models".into()));
        let report = result
            .into_report()
            .attach("while loading relay.toml")
            .unwrap_err();
        let display = format!("{report:?}");

        assert!(display.contains("missing models"));
        assert!(display.contains("while loading relay.toml"));
    }

    #[cfg(feature = "config")]
    #[test]
    fn config_error_converts_via_from() {
        let cfg_err = crate::config::ConfigError::UnsupportedFormat("xml".to_string());
        let relay_err: RelayError = cfg_err.into();

        assert!(matches!(relay_err, RelayError::Config(_)));
        assert!(relay_err.to_string().contains("xml"));
    }
}
