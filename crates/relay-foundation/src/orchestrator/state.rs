//! Per-request lifecycle.

use std::fmt;

use serde::Serialize;

/// Lifecycle of one generation request.
///
/// ```text
/// Pending ──▶ Routed ──▶ ContextBuilt ──▶ Streaming ──▶ Completed
///                            ▲                │   └───▶ Cancelled
///                            └── fallback ────┘   └───▶ Failed
/// ```
///
/// Any non-terminal state may move straight to `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Routed,
    ContextBuilt,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Routed => "routed",
            Self::ContextBuilt => "context_built",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
