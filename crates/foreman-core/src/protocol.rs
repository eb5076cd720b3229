//! JSON wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. Variant tags are
//! snake_case, fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::identity::Identity;
use crate::ids::{ConnectionId, MessageId, SessionId};
use crate::message::{Attachment, Message};

fn default_stream() -> bool {
    true
}

/// Events sent by a client to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// A user turn.
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        #[serde(default = "default_stream")]
        stream: bool,
    },
    /// The user is typing.
    Typing,
    /// Feedback on an assistant message.
    Reaction {
        message_id: MessageId,
        #[serde(default)]
        helpful: Option<bool>,
        #[serde(default)]
        rating: Option<u8>,
    },
    /// Heartbeat reply.
    Pong,
}

impl ClientEvent {
    /// Convenience constructor for a streamed user message.
    pub fn message(content: impl Into<String>, client_message_id: Option<String>) -> Self {
        Self::Message {
            content: content.into(),
            attachments: Vec::new(),
            client_message_id,
            stream: true,
        }
    }

    /// Wire tag, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Typing => "typing",
            Self::Reaction { .. } => "reaction",
            Self::Pong => "pong",
        }
    }
}

/// Terminal status reported in `stream_end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Complete,
    Errored,
    Cancelled,
}

/// Metadata attached to `stream_end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndMetadata {
    pub status: StreamStatus,
    /// Number of `stream_chunk` events sent for this message.
    pub fragment_count: u64,
    pub latency_ms: u64,
    /// True whenever the relayed content is not a finished answer.
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events sent by the server to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// The transport is attached. `session_id` is absent until the first
    /// message lazily creates a session; it is re-sent once one exists.
    Connected {
        session_id: Option<SessionId>,
        connection_id: ConnectionId,
    },
    /// A user message was accepted (or recognised as a retry).
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        message_id: MessageId,
        session_id: SessionId,
        duplicate: bool,
    },
    /// A complete, non-streamed message.
    Message { message: Message },
    /// An assistant answer starts streaming.
    StreamStart {
        session_id: SessionId,
        message_id: MessageId,
    },
    /// One answer fragment.
    StreamChunk {
        message_id: MessageId,
        sequence_number: u64,
        content: String,
    },
    /// The answer finished, failed, or was cancelled.
    StreamEnd {
        message_id: MessageId,
        metadata: StreamEndMetadata,
    },
    /// Another participant in the session is typing.
    Typing { identity: Identity },
    /// A reaction was recorded on a message.
    Reaction {
        message_id: MessageId,
        helpful: Option<bool>,
        rating: Option<u8>,
    },
    /// A request failed.
    Error { code: String, detail: String },
    /// Heartbeat probe; clients answer with `pong`.
    Ping,
}

impl ServerEvent {
    /// Error event for a failed request.
    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            detail: err.to_string(),
        }
    }

    /// Wire tag, for logs and metrics labels.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Ack { .. } => "ack",
            Self::Message { .. } => "message",
            Self::StreamStart { .. } => "stream_start",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamEnd { .. } => "stream_end",
            Self::Typing { .. } => "typing",
            Self::Reaction { .. } => "reaction",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_minimal_message() {
        let ev: ClientEvent =
            serde_json::from_value(json!({"type": "message", "content": "status?"})).unwrap();
        assert_eq!(
            ev,
            ClientEvent::Message {
                content: "status?".into(),
                attachments: vec![],
                client_message_id: None,
                stream: true,
            }
        );
    }

    #[test]
    fn parses_full_message() {
        let ev: ClientEvent = serde_json::from_value(json!({
            "type": "message",
            "content": "compare bids",
            "clientMessageId": "m1",
            "stream": false,
            "attachments": [{"id": "file_9", "name": "bid.pdf"}],
        }))
        .unwrap();
        let ClientEvent::Message {
            client_message_id,
            stream,
            attachments,
            ..
        } = ev
        else {
            panic!("expected message");
        };
        assert_eq!(client_message_id.as_deref(), Some("m1"));
        assert!(!stream);
        assert_eq!(attachments[0].name.as_deref(), Some("bid.pdf"));
    }

    #[test]
    fn parses_reaction_and_unit_events() {
        let ev: ClientEvent = serde_json::from_value(
            json!({"type": "reaction", "messageId": "msg_1", "helpful": true}),
        )
        .unwrap();
        assert_eq!(
            ev,
            ClientEvent::Reaction {
                message_id: MessageId::from_raw("msg_1"),
                helpful: Some(true),
                rating: None,
            }
        );
        let pong: ClientEvent = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, ClientEvent::Pong);
        let typing: ClientEvent = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(typing.type_name(), "typing");
    }

    #[test]
    fn rejects_unknown_type() {
        let res = serde_json::from_str::<ClientEvent>(r#"{"type":"shout"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn stream_chunk_wire_shape() {
        let ev = ServerEvent::StreamChunk {
            message_id: MessageId::from_raw("msg_7"),
            sequence_number: 3,
            content: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "stream_chunk", "messageId": "msg_7", "sequenceNumber": 3, "content": "abc"})
        );
    }

    #[test]
    fn stream_end_wire_shape() {
        let ev = ServerEvent::StreamEnd {
            message_id: MessageId::from_raw("msg_7"),
            metadata: StreamEndMetadata {
                status: StreamStatus::Errored,
                fragment_count: 2,
                latency_ms: 40,
                incomplete: true,
                error: Some("boom".into()),
            },
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "type": "stream_end",
                "messageId": "msg_7",
                "metadata": {
                    "status": "errored",
                    "fragmentCount": 2,
                    "latencyMs": 40,
                    "incomplete": true,
                    "error": "boom",
                },
            })
        );
    }

    #[test]
    fn connected_and_ping_wire_shape() {
        let ev = ServerEvent::Connected {
            session_id: None,
            connection_id: ConnectionId::from_raw("conn_1"),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "connected", "sessionId": null, "connectionId": "conn_1"})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn error_event_carries_code() {
        let ev = ServerEvent::error(&ChatError::RateLimited { retry_after_secs: 12 });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "RATE_LIMITED");
        assert!(v["detail"].as_str().unwrap().contains("12"));
    }

    #[test]
    fn server_events_roundtrip_for_clients() {
        let raw = json!({"type": "typing", "identity": "u2"});
        let ev: ServerEvent = serde_json::from_value(raw).unwrap();
        assert!(matches!(ev, ServerEvent::Typing { ref identity } if identity.as_str() == "u2"));
        assert_eq!(ev.type_name(), "typing");
    }
}
