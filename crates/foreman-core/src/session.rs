use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::ids::SessionId;

/// Lifecycle status of a stored session.
///
/// A session is `pending` only conceptually, before its first message is
/// accepted; no record exists in that state, so it has no variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Has received a message recently.
    Active,
    /// No activity for the configured idle period. Informational only.
    Idle,
    /// Explicitly closed. Readable, but rejects new messages.
    Closed,
}

impl SessionStatus {
    /// Whether new user messages may be appended.
    pub fn accepts_messages(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Per-session settings negotiated with the first message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Whether assistant answers are streamed as fragments.
    pub stream: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { stream: true }
    }
}

/// One logical conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub owner: Identity,
    pub project_ref: Option<String>,
    pub status: SessionStatus,
    pub settings: SessionSettings,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
