use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use async_stream::stream;
use futures::{Stream, StreamExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use foreman_core::{
    ChatError, ContextMessage, ContextWindow, Fragment, FragmentBody, Message, MessageId, Role,
    SessionId,
};
use foreman_llm::{FragmentSequence, RESPONDER_FAILURE_CODE};
use foreman_store::{Finalize, MessageRepo};

use super::SessionOrchestrator;
use crate::metrics::{CHAT_FRAGMENTS_TOTAL, CHAT_RESPONDER_ERRORS_TOTAL};

const PERSIST_FAILURE_CODE: &str = "INTERNAL";
const EMPTY_ANSWER_DETAIL: &str = "empty response";

/// The answer to one user turn, as a lazy, finite, non-restartable fragment
/// stream.
///
/// Every text fragment is appended to the stored message before it is
/// yielded. When the stream ends the stored message is terminal: complete,
/// or errored and marked incomplete. An answer with no text at all ends in
/// an error fragment. Dropping the stream early also leaves it errored.
pub struct AssistantStream {
    message: Message,
    fragments: Pin<Box<dyn Stream<Item = Fragment> + Send>>,
}

impl AssistantStream {
    pub fn message_id(&self) -> &MessageId {
        &self.message.id
    }

    /// The assistant message as created, in the `streaming` state.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl Stream for AssistantStream {
    type Item = Fragment;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Fragment>> {
        self.get_mut().fragments.as_mut().poll_next(cx)
    }
}

impl SessionOrchestrator {
    /// Invoke the responder for `user_message_id` and return its answer as
    /// a stream of persisted fragments.
    ///
    /// The responder sees the last completed messages of the session. User
    /// messages sent after this one are left out; answers that finished
    /// after it was sent are kept. Cancelling `cancel` stops the responder
    /// and finalizes the answer as errored.
    #[instrument(skip(self, cancel), fields(session_id = %session_id, user_message_id = %user_message_id))]
    pub fn stream_assistant_response(
        &self,
        session_id: &SessionId,
        user_message_id: &MessageId,
        cancel: CancellationToken,
    ) -> Result<AssistantStream, ChatError> {
        let session = self.sessions.get(session_id)?;
        let question = self.messages.get(user_message_id)?;
        if question.session_id != *session_id || question.role != Role::User {
            return Err(ChatError::NotFound(format!("user message {user_message_id}")));
        }

        let history = self
            .messages
            .recent_context(session_id, self.config.context_window_messages)?;
        let context = ContextWindow {
            session_id: session_id.clone(),
            project_ref: session.project_ref,
            messages: history
                .into_iter()
                .filter(|m| m.sequence <= question.sequence || m.role == Role::Assistant)
                .map(|m| ContextMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
        };

        let message = self.messages.begin_assistant(session_id, user_message_id)?;
        let inner = self.responder.stream(context, cancel.clone());
        let fragments = persist_fragments(self.messages.clone(), message.id.clone(), inner, cancel);
        Ok(AssistantStream { message, fragments })
    }
}

/// Finalizes the stored message exactly once, including when the stream is
/// dropped mid-answer.
struct Finalizer {
    messages: MessageRepo,
    message_id: MessageId,
    started: Instant,
    done: bool,
}

impl Finalizer {
    fn new(messages: MessageRepo, message_id: MessageId) -> Self {
        Self {
            messages,
            message_id,
            started: Instant::now(),
            done: false,
        }
    }

    fn latency_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn finish(&mut self, outcome: &Finalize) {
        self.done = true;
        if let Err(e) = self.messages.finalize(&self.message_id, outcome) {
            error!(message_id = %self.message_id, error = %e, "failed to finalize answer");
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if !self.done {
            let outcome = Finalize::errored(self.latency_ms(), "answer abandoned");
            self.finish(&outcome);
        }
    }
}

fn persist_fragments(
    messages: MessageRepo,
    message_id: MessageId,
    mut inner: FragmentSequence,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = Fragment> + Send>> {
    let mut finalizer = Finalizer::new(messages.clone(), message_id.clone());
    Box::pin(stream! {
        let mut relayed: u64 = 0;
        while let Some(fragment) = inner.next().await {
            match &fragment.body {
                FragmentBody::Text { content } => {
                    if let Err(e) = messages.append_fragment(&message_id, fragment.sequence_number, content) {
                        error!(message_id = %message_id, seq = fragment.sequence_number, error = %e, "failed to persist fragment");
                        let detail = format!("failed to persist answer: {e}");
                        let latency = finalizer.latency_ms();
                        finalizer.finish(&Finalize::errored(latency, detail.clone()));
                        yield Fragment::error(fragment.sequence_number, PERSIST_FAILURE_CODE, detail);
                        return;
                    }
                    counter!(CHAT_FRAGMENTS_TOTAL).increment(1);
                    relayed += 1;
                    yield fragment;
                }
                FragmentBody::Error { code, detail } => {
                    counter!(CHAT_RESPONDER_ERRORS_TOTAL, "code" => code.clone()).increment(1);
                    warn!(message_id = %message_id, code = %code, detail = %detail, "responder failed mid-answer");
                    let latency = finalizer.latency_ms();
                    finalizer.finish(&Finalize::errored(latency, detail.clone()));
                    yield fragment;
                    return;
                }
            }
        }

        drop(inner);
        let latency = finalizer.latency_ms();
        if cancel.is_cancelled() {
            finalizer.finish(&Finalize::errored(latency, "cancelled"));
        } else if relayed == 0 {
            counter!(CHAT_RESPONDER_ERRORS_TOTAL, "code" => RESPONDER_FAILURE_CODE).increment(1);
            warn!(message_id = %message_id, "responder produced no text");
            finalizer.finish(&Finalize::errored(latency, EMPTY_ANSWER_DETAIL));
            yield Fragment::error(0, RESPONDER_FAILURE_CODE, EMPTY_ANSWER_DETAIL);
        } else {
            finalizer.finish(&Finalize::complete(latency));
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use foreman_core::{Identity, MessageState, ResponderError};
    use foreman_llm::MockReply;

    use super::super::SubmitMessage;
    use super::super::test_support::harness;
    use super::*;

    async fn ask(h: &super::super::test_support::Harness, text: &str) -> (SessionId, MessageId) {
        let out = h
            .orch
            .submit_user_message(&Identity::new("U1"), SubmitMessage::new(None, text))
            .await
            .unwrap();
        (out.session.id, out.message.id)
    }

    fn texts(fragments: &[Fragment]) -> String {
        fragments.iter().filter_map(Fragment::content).collect()
    }

    #[tokio::test]
    async fn fragments_are_numbered_and_persisted() {
        let h = harness(vec![MockReply::Fragments(vec!["All ".into(), "on ".into(), "track.".into()])]);
        let (sid, uid) = ask(&h, "status?").await;

        let stream = h.orch.stream_assistant_response(&sid, &uid, CancellationToken::new()).unwrap();
        let answer_id = stream.message_id().clone();
        assert_eq!(stream.message().state, MessageState::Streaming);
        let fragments: Vec<Fragment> = stream.collect().await;

        let seqs: Vec<u64> = fragments.iter().map(|f| f.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let stored = h.orch.messages.get(&answer_id).unwrap();
        assert_eq!(stored.state, MessageState::Complete);
        assert_eq!(stored.content, texts(&fragments));
        assert_eq!(stored.content, "All on track.");
        assert_eq!(stored.metadata.fragment_count, 3);
        assert!(!stored.metadata.incomplete);
        assert_eq!(stored.reply_to.as_ref(), Some(&uid));
    }

    #[tokio::test]
    async fn failure_after_two_fragments_finalizes_errored() {
        let h = harness(vec![MockReply::FailAfter(
            vec!["Budget ".into(), "is ".into()],
            ResponderError::Internal("model crashed".into()),
        )]);
        let (sid, uid) = ask(&h, "budget?").await;

        let stream = h.orch.stream_assistant_response(&sid, &uid, CancellationToken::new()).unwrap();
        let answer_id = stream.message_id().clone();
        let fragments: Vec<Fragment> = stream.collect().await;

        assert_eq!(fragments.len(), 3);
        assert!(fragments[2].is_error());
        assert_eq!(fragments[2].sequence_number, 2);
        let stored = h.orch.messages.get(&answer_id).unwrap();
        assert_eq!(stored.state, MessageState::Errored);
        assert_eq!(stored.content, "Budget is ");
        assert!(stored.metadata.incomplete);
        assert!(stored.metadata.error.unwrap().contains("model crashed"));
    }

    #[tokio::test]
    async fn answer_without_text_finalizes_errored() {
        let h = harness(vec![MockReply::Value(String::new()), MockReply::Fragments(Vec::new())]);
        for question in ["anything?", "still nothing?"] {
            let (sid, uid) = ask(&h, question).await;
            let stream = h.orch.stream_assistant_response(&sid, &uid, CancellationToken::new()).unwrap();
            let answer_id = stream.message_id().clone();
            let fragments: Vec<Fragment> = stream.collect().await;

            assert_eq!(fragments.len(), 1);
            assert!(fragments[0].is_error());
            assert_eq!(fragments[0].sequence_number, 0);
            let stored = h.orch.messages.get(&answer_id).unwrap();
            assert_eq!(stored.state, MessageState::Errored);
            assert!(stored.metadata.incomplete);
            assert_eq!(stored.metadata.error.as_deref(), Some(EMPTY_ANSWER_DETAIL));
        }
    }

    #[tokio::test]
    async fn single_value_answer_is_chunked() {
        let long = "The concrete pour on level three finished ahead of schedule and inspection passed.";
        let h = harness(vec![MockReply::Value(long.into())]);
        let (sid, uid) = ask(&h, "level three?").await;

        let fragments: Vec<Fragment> = h
            .orch
            .stream_assistant_response(&sid, &uid, CancellationToken::new())
            .unwrap()
            .collect()
            .await;
        assert!(fragments.len() > 1);
        assert_eq!(texts(&fragments), long);
    }

    #[tokio::test]
    async fn context_is_bounded_to_completed_turns_before_the_question() {
        let h = harness(vec![
            MockReply::Fragments(vec!["first answer".into()]),
            MockReply::Fragments(vec!["second answer".into()]),
        ]);
        let identity = Identity::new("U1");
        let (sid, q1) = ask(&h, "first?").await;
        let _: Vec<Fragment> = h
            .orch
            .stream_assistant_response(&sid, &q1, CancellationToken::new())
            .unwrap()
            .collect()
            .await;
        let q2 = h
            .orch
            .submit_user_message(&identity, SubmitMessage::new(Some(sid.clone()), "second?"))
            .await
            .unwrap()
            .message
            .id;
        let later = h
            .orch
            .submit_user_message(&identity, SubmitMessage::new(Some(sid.clone()), "third?"))
            .await
            .unwrap();
        assert!(later.message.sequence > 3);

        let _: Vec<Fragment> = h
            .orch
            .stream_assistant_response(&sid, &q2, CancellationToken::new())
            .unwrap()
            .collect()
            .await;

        let contexts = h.mock.contexts();
        let seen: Vec<&str> = contexts[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(seen, vec!["first?", "first answer", "second?"]);
    }

    #[tokio::test]
    async fn cancellation_stops_responder_and_marks_incomplete() {
        let h = harness(vec![MockReply::Hang(vec!["Working".into()])]);
        let (sid, uid) = ask(&h, "long job?").await;
        let cancel = CancellationToken::new();

        let mut stream = h.orch.stream_assistant_response(&sid, &uid, cancel.clone()).unwrap();
        let answer_id = stream.message_id().clone();
        let first = stream.next().await.unwrap();
        assert_eq!(first.content(), Some("Working"));
        assert_eq!(h.mock.live_streams(), 1);

        cancel.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(h.mock.live_streams(), 0);

        let stored = h.orch.messages.get(&answer_id).unwrap();
        assert_eq!(stored.state, MessageState::Errored);
        assert_eq!(stored.content, "Working");
        assert!(stored.metadata.incomplete);
        assert_eq!(stored.metadata.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn dropping_the_stream_leaves_an_explicitly_incomplete_answer() {
        let h = harness(vec![MockReply::Paced(
            vec!["a".into(), "b".into(), "c".into()],
            Duration::from_millis(1),
        )]);
        let (sid, uid) = ask(&h, "q").await;
        let mut stream = h.orch.stream_assistant_response(&sid, &uid, CancellationToken::new()).unwrap();
        let answer_id = stream.message_id().clone();
        let _ = stream.next().await.unwrap();
        drop(stream);

        let stored = h.orch.messages.get(&answer_id).unwrap();
        assert_eq!(stored.state, MessageState::Errored);
        assert_eq!(stored.content, "a");
        assert!(stored.metadata.incomplete);
    }

    #[tokio::test]
    async fn errored_answers_are_left_out_of_later_context() {
        let h = harness(vec![
            MockReply::FailAfter(vec!["partial".into()], ResponderError::Internal("x".into())),
            MockReply::Fragments(vec!["ok".into()]),
        ]);
        let identity = Identity::new("U1");
        let (sid, q1) = ask(&h, "one").await;
        let _: Vec<Fragment> = h
            .orch
            .stream_assistant_response(&sid, &q1, CancellationToken::new())
            .unwrap()
            .collect()
            .await;
        let q2 = h
            .orch
            .submit_user_message(&identity, SubmitMessage::new(Some(sid.clone()), "two"))
            .await
            .unwrap()
            .message
            .id;
        let _: Vec<Fragment> = h
            .orch
            .stream_assistant_response(&sid, &q2, CancellationToken::new())
            .unwrap()
            .collect()
            .await;

        let contexts = h.mock.contexts();
        assert!(contexts[1].messages.iter().all(|m| m.content != "partial"));
    }

    #[tokio::test]
    async fn unknown_user_message_is_not_found() {
        let h = harness(vec![]);
        let (sid, _) = ask(&h, "q").await;
        let err = h
            .orch
            .stream_assistant_response(&sid, &MessageId::new(), CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
