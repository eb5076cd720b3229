use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ResponderError;
use crate::ids::SessionId;
use crate::message::Role;

/// A lazy sequence of answer text pieces from a streaming responder.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ResponderError>> + Send>>;

/// What the external responder produced.
pub enum ResponderOutput {
    /// A single final answer.
    Value(String),
    /// Incremental answer text.
    Stream(FragmentStream),
}

impl std::fmt::Debug for ResponderOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(&v.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One prior turn handed to the responder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

/// Bounded suffix of a session's history, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindow {
    pub session_id: SessionId,
    pub project_ref: Option<String>,
    pub messages: Vec<ContextMessage>,
}

impl ContextWindow {
    /// The most recent user turn, if any.
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// The AI analysis collaborator. Model selection and prompting live behind it.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &str;

    /// Produce an answer for the given context.
    async fn respond(&self, context: &ContextWindow) -> Result<ResponderOutput, ResponderError>;
}
