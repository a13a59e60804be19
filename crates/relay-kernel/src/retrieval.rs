//! Read interface to the external retrieval store.

use async_trait::async_trait;
use thiserror::Error;

use crate::generation::RetrievedPassage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RetrievalError {
    /// The store could not answer. Generation proceeds without context.
    #[error("Retrieval unavailable: {0}")]
    Unavailable(String),
}

/// Looks up passages relevant to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` passages, best first.
    async fn lookup(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError>;
}

impl From<RetrievalError> for crate::error::RelayError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Unavailable(msg) => Self::RetrievalUnavailable(msg),
        }
    }
}
