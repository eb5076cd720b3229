use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use foreman_core::{ContextWindow, Responder, ResponderError, ResponderOutput};

/// Streams the latest user message back word by word. Used by `serve --echo`.
#[derive(Clone, Debug)]
pub struct EchoResponder {
    pace: Duration,
}

impl EchoResponder {
    pub fn new(pace: Duration) -> Self {
        Self { pace }
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

#[async_trait]
impl Responder for EchoResponder {
    fn name(&self) -> &str {
        "echo"
    }

    async fn respond(&self, context: &ContextWindow) -> Result<ResponderOutput, ResponderError> {
        let question = context
            .latest_user_message()
            .ok_or_else(|| ResponderError::InvalidRequest("no user message in context".into()))?;
        let answer = format!("You asked: {question}");
        let words: Vec<String> = answer.split_inclusive(' ').map(str::to_owned).collect();
        let pace = self.pace;

        Ok(ResponderOutput::Stream(Box::pin(stream! {
            for word in words {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                yield Ok::<_, ResponderError>(word);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use foreman_core::{ContextMessage, Role, SessionId};
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn echoes_latest_question() {
        let ctx = ContextWindow {
            session_id: SessionId::from_raw("sess_echo"),
            project_ref: None,
            messages: vec![ContextMessage {
                role: Role::User,
                content: "status?".into(),
            }],
        };
        let Ok(ResponderOutput::Stream(stream)) = EchoResponder::new(Duration::ZERO).respond(&ctx).await
        else {
            panic!("expected a stream");
        };
        let words: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(words.concat(), "You asked: status?");
        assert_eq!(words.len(), 3);
    }

    #[tokio::test]
    async fn empty_context_is_invalid() {
        let ctx = ContextWindow {
            session_id: SessionId::from_raw("sess_echo"),
            project_ref: None,
            messages: Vec::new(),
        };
        assert!(EchoResponder::default().respond(&ctx).await.is_err());
    }
}
