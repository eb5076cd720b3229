use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foreman_core::{ContextWindow, Fragment, Responder, ResponderOutput};

use crate::chunk::{ChunkConfig, chunk_text};

/// Error code carried by the terminal fragment when the responder fails.
pub const RESPONDER_FAILURE_CODE: &str = "RESPONDER_FAILURE";

/// Ordered fragments for one assistant answer.
///
/// Lazy, finite, and not restartable. Sequence numbers start at 0 and
/// increase by 1. At most one error fragment appears, and only last.
pub type FragmentSequence = Pin<Box<dyn Stream<Item = Fragment> + Send>>;

/// Wraps a [`Responder`] so every answer looks the same to the orchestrator.
#[derive(Clone)]
pub struct StreamingResponder {
    inner: Arc<dyn Responder>,
    chunking: ChunkConfig,
}

impl StreamingResponder {
    pub fn new(inner: Arc<dyn Responder>, chunking: ChunkConfig) -> Self {
        Self { inner, chunking }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Produce the fragment sequence for `context`.
    ///
    /// When `cancel` fires the sequence ends without a terminal fragment and
    /// the responder's stream is dropped, so no further output is pulled
    /// from it.
    pub fn stream(&self, context: ContextWindow, cancel: CancellationToken) -> FragmentSequence {
        let responder = Arc::clone(&self.inner);
        let chunking = self.chunking;

        Box::pin(stream! {
            let mut seq: u64 = 0;

            let output = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                out = responder.respond(&context) => Some(out),
            };
            let Some(output) = output else {
                debug!(session_id = %context.session_id, "cancelled before responder answered");
                return;
            };

            match output {
                Err(e) => {
                    warn!(session_id = %context.session_id, kind = e.error_kind(), error = %e, "responder failed");
                    yield Fragment::error(seq, RESPONDER_FAILURE_CODE, e.to_string());
                }
                Ok(ResponderOutput::Value(text)) => {
                    for (i, piece) in chunk_text(&text, chunking.max_chars).into_iter().enumerate() {
                        if i > 0 && !chunking.pace.is_zero() {
                            let paced = tokio::select! {
                                biased;
                                () = cancel.cancelled() => false,
                                () = tokio::time::sleep(chunking.pace) => true,
                            };
                            if !paced {
                                return;
                            }
                        }
                        if cancel.is_cancelled() {
                            return;
                        }
                        yield Fragment::text(seq, piece);
                        seq += 1;
                    }
                }
                Ok(ResponderOutput::Stream(mut inner)) => loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        next = inner.next() => Some(next),
                    };
                    match next {
                        None => {
                            debug!(session_id = %context.session_id, fragments = seq, "cancelled mid-stream");
                            break;
                        }
                        Some(None) => break,
                        Some(Some(Ok(text))) => {
                            if text.is_empty() {
                                continue;
                            }
                            yield Fragment::text(seq, text);
                            seq += 1;
                        }
                        Some(Some(Err(e))) => {
                            warn!(
                                session_id = %context.session_id,
                                kind = e.error_kind(),
                                fragments = seq,
                                error = %e,
                                "responder stream failed"
                            );
                            yield Fragment::error(seq, RESPONDER_FAILURE_CODE, e.to_string());
                            break;
                        }
                    }
                },
            }
        })
    }
}
