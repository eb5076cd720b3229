use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_core::{
    FragmentBody, MessageId, MessageState, ServerEvent, SessionId, StreamEndMetadata, StreamStatus,
};

use super::SessionOrchestrator;
use crate::metrics::{CHAT_TURN_DURATION_SECONDS, CHAT_TURNS_TOTAL};

/// Turn state shared by every queued or running turn of one session.
pub(crate) struct SessionTurns {
    /// Held for the whole answer so a session never streams two at once.
    lock: tokio::sync::Mutex<()>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl SessionTurns {
    fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel every turn enqueued so far. Turns started afterwards get a
    /// fresh token.
    pub(crate) fn cancel(&self) {
        let old = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        old.cancel();
    }
}

impl SessionOrchestrator {
    /// Queue the assistant answer to `user_message_id` and relay it to the
    /// session's transports.
    ///
    /// Turns of one session run one at a time in the order they were
    /// started. With `stream` set the answer is relayed as
    /// `stream_start`, `stream_chunk`* and `stream_end`; otherwise a single
    /// `message` event carries the finished answer.
    pub fn start_turn(&self, session_id: SessionId, user_message_id: MessageId, stream: bool) -> JoinHandle<()> {
        let turns = Arc::clone(
            self.turns
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(SessionTurns::new()))
                .value(),
        );
        let cancel = turns.token();
        let this = self.clone();

        tokio::spawn(async move {
            {
                let _serial = turns.lock.lock().await;
                if cancel.is_cancelled() {
                    debug!(session_id = %session_id, user_message_id = %user_message_id, "turn cancelled before it started");
                    counter!(CHAT_TURNS_TOTAL, "status" => "cancelled").increment(1);
                } else {
                    this.run_turn(&session_id, &user_message_id, stream, cancel).await;
                }
            }
            drop(turns);
            let _ = this
                .turns
                .remove_if(&session_id, |_, t| Arc::strong_count(t) == 1);
        })
    }

    async fn run_turn(
        &self,
        session_id: &SessionId,
        user_message_id: &MessageId,
        stream: bool,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let mut answer = match self.stream_assistant_response(session_id, user_message_id, cancel.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %session_id, user_message_id = %user_message_id, error = %e, "could not start answer");
                self.sink.publish(session_id, &ServerEvent::error(&e), None);
                counter!(CHAT_TURNS_TOTAL, "status" => "failed").increment(1);
                return;
            }
        };
        let message_id = answer.message_id().clone();

        if stream {
            self.sink.publish(
                session_id,
                &ServerEvent::StreamStart {
                    session_id: session_id.clone(),
                    message_id: message_id.clone(),
                },
                None,
            );
        }

        let mut relayed: u64 = 0;
        let mut failure: Option<String> = None;
        while let Some(fragment) = answer.next().await {
            match fragment.body {
                FragmentBody::Text { content } => {
                    relayed += 1;
                    if stream {
                        self.sink.publish(
                            session_id,
                            &ServerEvent::StreamChunk {
                                message_id: message_id.clone(),
                                sequence_number: fragment.sequence_number,
                                content,
                            },
                            None,
                        );
                    }
                }
                FragmentBody::Error { code, detail } => {
                    failure = Some(format!("{code}: {detail}"));
                }
            }
        }
        drop(answer);

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let stored = match self.messages.get(&message_id) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "answer vanished after streaming");
                None
            }
        };

        let status = match &stored {
            Some(m) if m.state == MessageState::Complete => StreamStatus::Complete,
            _ if cancel.is_cancelled() => StreamStatus::Cancelled,
            _ => StreamStatus::Errored,
        };

        match stored {
            Some(message) if !stream => {
                self.sink.publish(session_id, &ServerEvent::Message { message }, None);
            }
            stored => {
                let error = stored
                    .as_ref()
                    .and_then(|m| m.metadata.error.clone())
                    .or(failure);
                let metadata = StreamEndMetadata {
                    status,
                    fragment_count: relayed,
                    latency_ms: stored
                        .as_ref()
                        .and_then(|m| m.metadata.latency_ms)
                        .unwrap_or(latency_ms),
                    incomplete: status != StreamStatus::Complete,
                    error: if status == StreamStatus::Complete { None } else { error },
                };
                self.sink.publish(
                    session_id,
                    &ServerEvent::StreamEnd {
                        message_id: message_id.clone(),
                        metadata,
                    },
                    None,
                );
            }
        }

        let label = match status {
            StreamStatus::Complete => "complete",
            StreamStatus::Errored => "errored",
            StreamStatus::Cancelled => "cancelled",
        };
        counter!(CHAT_TURNS_TOTAL, "status" => label).increment(1);
        histogram!(CHAT_TURN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            session_id = %session_id,
            message_id = %message_id,
            status = label,
            fragments = relayed,
            latency_ms,
            "turn finished"
        );
    }
}
