//! Shared vocabulary for Foreman chat sessions.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ids` | Branded, time-ordered identifiers |
//! | `identity` | Verified caller identity and the verifier seam |
//! | `session` | Session record and lifecycle status |
//! | `message` | Message turns, metadata, reactions |
//! | `fragment` | Ordered pieces of a streamed assistant answer |
//! | `responder` | External AI responder seam and context window |
//! | `protocol` | JSON wire events exchanged over the WebSocket |
//! | `errors` | Error taxonomy surfaced to clients |

#![deny(unsafe_code)]

pub mod errors;
pub mod fragment;
pub mod identity;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod responder;
pub mod session;

pub use errors::{AuthError, ChatError, ResponderError};
pub use fragment::{Fragment, FragmentBody};
pub use identity::{Credentials, Identity, IdentityVerifier};
pub use ids::{ClientInstanceId, ConnectionId, MessageId, SessionId};
pub use message::{Attachment, Message, MessageMetadata, MessageState, Reaction, Role};
pub use protocol::{ClientEvent, ServerEvent, StreamEndMetadata, StreamStatus};
pub use responder::{ContextMessage, ContextWindow, FragmentStream, Responder, ResponderOutput};
pub use session::{Session, SessionSettings, SessionStatus};
