use serde::{Deserialize, Serialize};

/// One ordered piece of an incrementally delivered assistant answer.
///
/// Sequence numbers start at 0 and increase by exactly 1. Concatenating the
/// text of all `Text` fragments in order yields the persisted content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub sequence_number: u64,
    pub body: FragmentBody,
}

/// Payload of a fragment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FragmentBody {
    /// A piece of answer text.
    Text { content: String },
    /// Terminal marker: the responder failed or the turn was cancelled.
    Error { code: String, detail: String },
}

impl Fragment {
    /// Text fragment.
    pub fn text(sequence_number: u64, content: impl Into<String>) -> Self {
        Self {
            sequence_number,
            body: FragmentBody::Text {
                content: content.into(),
            },
        }
    }

    /// Terminal error fragment.
    pub fn error(sequence_number: u64, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            sequence_number,
            body: FragmentBody::Error {
                code: code.into(),
                detail: detail.into(),
            },
        }
    }

    /// Text content, if this is a text fragment.
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            FragmentBody::Text { content } => Some(content),
            FragmentBody::Error { .. } => None,
        }
    }

    /// Whether this fragment terminates the sequence with a failure.
    pub fn is_error(&self) -> bool {
        matches!(self.body, FragmentBody::Error { .. })
    }
}
