use error_stack::Report;
use relay_kernel::RelayError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<Report<RelayError>> for CliError {
    fn from(report: Report<RelayError>) -> Self {
        // Debug output carries the attached file and stage context.
        Self::ConfigError(format!("{report:?}"))
    }
}
