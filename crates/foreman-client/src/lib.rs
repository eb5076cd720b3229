//! # foreman-client
//!
//! Client side of a Foreman chat session. Hides transport churn from the UI.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`transport`] | Reconnecting WebSocket, bounded outbox, heartbeat replies |
//! | [`assembler`] | Fragment reassembly with gap detection |
//! | [`typing`] | Self-expiring typing indicators |
//! | [`dispatch`] | Typed handler table for everything the UI can observe |
//! | [`history`] | HTTP history queries, used after reconnecting |
//! | [`backoff`] | Capped, jittered exponential reconnect delays |

#![deny(unsafe_code)]

pub mod assembler;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod transport;
pub mod typing;

pub use assembler::{AssembledMessage, FragmentAssembler, PushOutcome};
pub use backoff::Backoff;
pub use config::ClientConfig;
pub use dispatch::{ClientUpdate, Dispatcher, EventKind, Notice};
pub use error::ClientError;
pub use history::{HistoryClient, MessagePage, SessionList};
pub use transport::{ConnectionState, TransportManager};
pub use typing::{TypingTracker, TypingUpdate};
