use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;

use foreman_core::{ContextWindow, FragmentStream, Responder, ResponderError, ResponderOutput};

/// Pre-programmed replies for deterministic testing without a real responder.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Return a single final answer.
    Value(String),
    /// Stream these fragments, then end.
    Fragments(Vec<String>),
    /// Stream these fragments with a pause before each one.
    Paced(Vec<String>, Duration),
    /// Stream these fragments, then fail.
    FailAfter(Vec<String>, ResponderError),
    /// Fail the `respond` call itself.
    Error(ResponderError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Stream these fragments, then never yield again.
    Hang(Vec<String>),
}

enum Tail {
    End,
    Fail(ResponderError),
    Hang,
}

/// Responder that replays [`MockReply`]s in order.
///
/// Once the script runs out the repeat reply is used, if one was set.
/// Otherwise the call fails with `InvalidRequest`.
pub struct MockResponder {
    replies: Mutex<VecDeque<MockReply>>,
    repeat: Option<MockReply>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<ContextWindow>>,
    live_streams: Arc<AtomicUsize>,
}

impl MockResponder {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A responder that gives the same reply to every call.
    pub fn repeating(reply: MockReply) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Context windows received so far, in call order.
    pub fn contexts(&self) -> Vec<ContextWindow> {
        self.contexts.lock().clone()
    }

    /// Streams handed out that have not been dropped yet.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    fn fragment_stream(&self, fragments: Vec<String>, pace: Duration, tail: Tail) -> FragmentStream {
        let guard = LiveGuard::new(Arc::clone(&self.live_streams));
        Box::pin(stream! {
            let _guard = guard;
            for fragment in fragments {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                yield Ok(fragment);
            }
            match tail {
                Tail::End => {}
                Tail::Fail(e) => {
                    yield Err(e);
                }
                Tail::Hang => futures::future::pending::<()>().await,
            }
        })
    }
}

#[async_trait]
impl Responder for MockResponder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn respond(&self, context: &ContextWindow) -> Result<ResponderOutput, ResponderError> {
        let idx = self.calls.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().push(context.clone());

        let scripted = self.replies.lock().pop_front();
        let Some(mut reply) = scripted.or_else(|| self.repeat.clone()) else {
            return Err(ResponderError::InvalidRequest(format!(
                "MockResponder: no reply configured for call {idx}"
            )));
        };

        loop {
            reply = match reply {
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    *inner
                }
                MockReply::Value(text) => return Ok(ResponderOutput::Value(text)),
                MockReply::Error(e) => return Err(e),
                MockReply::Fragments(f) => {
                    return Ok(ResponderOutput::Stream(self.fragment_stream(f, Duration::ZERO, Tail::End)));
                }
                MockReply::Paced(f, pace) => {
                    return Ok(ResponderOutput::Stream(self.fragment_stream(f, pace, Tail::End)));
                }
                MockReply::FailAfter(f, e) => {
                    return Ok(ResponderOutput::Stream(self.fragment_stream(f, Duration::ZERO, Tail::Fail(e))));
                }
                MockReply::Hang(f) => {
                    return Ok(ResponderOutput::Stream(self.fragment_stream(f, Duration::ZERO, Tail::Hang)));
                }
            };
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use foreman_core::SessionId;
    use futures::StreamExt;

    use super::*;

    fn ctx() -> ContextWindow {
        ContextWindow {
            session_id: SessionId::from_raw("sess_mock"),
            project_ref: None,
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replies_in_order_then_fails() {
        let mock = MockResponder::new(vec![MockReply::Value("one".into())]);
        assert!(matches!(mock.respond(&ctx()).await, Ok(ResponderOutput::Value(v)) if v == "one"));
        assert!(matches!(
            mock.respond(&ctx()).await,
            Err(ResponderError::InvalidRequest(_))
        ));
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.contexts().len(), 2);
    }

    #[tokio::test]
    async fn repeating_never_runs_out() {
        let mock = MockResponder::repeating(MockReply::Value("ok".into()));
        for _ in 0..3 {
            assert!(mock.respond(&ctx()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn fail_after_yields_then_errors() {
        let mock = MockResponder::new(vec![MockReply::FailAfter(
            vec!["a".into()],
            ResponderError::Internal("x".into()),
        )]);
        let Ok(ResponderOutput::Stream(stream)) = mock.respond(&ctx()).await else {
            panic!("expected a stream");
        };
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert_eq!(mock.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_wraps_any_reply() {
        let mock = MockResponder::new(vec![MockReply::Delay(
            Duration::from_secs(5),
            Box::new(MockReply::Error(ResponderError::Timeout(Duration::from_secs(5)))),
        )]);
        let start = tokio::time::Instant::now();
        assert!(mock.respond(&ctx()).await.is_err());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
