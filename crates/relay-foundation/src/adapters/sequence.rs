//! Stream contract enforcement for adapter output.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use relay_kernel::{AdapterChunk, AdapterError, ChunkStream, ModelId};
use tracing::warn;

/// Wrap adapter output so contract violations surface as fatal errors.
///
/// Sequence numbers must start at 0 and increase by one. The wrapper ends
/// the stream after the first finish chunk or error, and an inner stream
/// that ends without a finish chunk yields one fatal error.
pub fn validate_sequence(model_id: ModelId, inner: ChunkStream) -> ChunkStream {
    Box::pin(SequencedStream {
        model_id,
        inner: Some(inner),
        expected: 0,
    })
}

struct SequencedStream {
    model_id: ModelId,
    inner: Option<ChunkStream>,
    expected: u64,
}

impl SequencedStream {
    fn close(&mut self) {
        // dropping the inner stream releases adapter resources promptly
        self.inner = None;
    }
}

impl Stream for SequencedStream {
    type Item = Result<AdapterChunk, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if chunk.sequence != this.expected {
                    warn!(
                        model = %this.model_id,
                        expected = this.expected,
                        got = chunk.sequence,
                        "adapter broke sequence contract"
                    );
                    let expected = this.expected;
                    this.close();
                    return Poll::Ready(Some(Err(AdapterError::fatal(format!(
                        "chunk sequence out of order: expected {expected}, got {}",
                        chunk.sequence
                    )))));
                }
                this.expected += 1;
                if chunk.is_final() {
                    this.close();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.close();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(Some(Err(AdapterError::fatal(
                    "adapter stream ended without a finish chunk",
                ))))
            }
        }
    }
}
