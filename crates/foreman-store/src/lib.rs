//! Durable record of chat sessions and their append-only message logs.
//!
//! The store is the single source of truth for sessions; live connections
//! are routing metadata kept elsewhere and never persisted.

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use messages::{AppendOutcome, Finalize, MessageRepo, NewUserTurn};
pub use sessions::SessionRepo;
