//! Caller-side view of one generation request.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use relay_kernel::{ModelId, ResponseChunk};
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::RequestState;
use crate::router::RouteReason;

/// One candidate model tried for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub model_id: ModelId,
    pub reason: RouteReason,
    /// Text chunks relayed to the caller by this attempt.
    pub relayed_chunks: u64,
    /// Why the attempt ended early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) type AttemptLog = Arc<Mutex<Vec<AttemptRecord>>>;

/// Handle returned by
/// [`GenerationOrchestrator::submit`](super::GenerationOrchestrator::submit).
///
/// Polling the handle yields the response chunks; the last one has `done`
/// set. Dropping the handle before the end cancels the request.
pub struct GenerationHandle {
    session_id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<RequestState>,
    attempts: AttemptLog,
    chunks: ReceiverStream<ResponseChunk>,
}

impl GenerationHandle {
    pub(crate) fn new(
        session_id: Uuid,
        cancel: CancellationToken,
        state: watch::Receiver<RequestState>,
        attempts: AttemptLog,
        chunks: ReceiverStream<ResponseChunk>,
    ) -> Self {
        Self {
            session_id,
            cancel,
            state,
            attempts,
            chunks,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Request cancellation. Has no effect once the request has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Resolves once the request reaches a terminal state.
    pub async fn finished(&mut self) -> RequestState {
        // Err only when the driver vanished without a terminal state (runtime shutdown)
        let _ = self.state.wait_for(|s| s.is_terminal()).await;
        *self.state.borrow()
    }

    /// Candidates tried so far, in order.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.lock().clone()
    }
}

impl Stream for GenerationHandle {
    type Item = ResponseChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().chunks.poll_next_unpin(cx)
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for GenerationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandle")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}
