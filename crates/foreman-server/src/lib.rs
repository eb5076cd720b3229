//! # foreman-server
//!
//! Axum HTTP + `WebSocket` server for real-time project chat.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`orchestrator`] | Validation, dedup, rate limiting, persistence, and answer streaming per session |
//! | [`websocket`] | Connection registry, heartbeat, and the per-connection session loop |
//! | [`routes`] | History and session management over HTTP |
//! | [`server`] | Router, listener, background sweepers |
//! | [`auth`] | Bearer-token identity verification |
//! | [`shutdown`] | Graceful shutdown via `CancellationToken` |

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::StaticTokenVerifier;
pub use config::{ChatConfig, ServerConfig};
pub use orchestrator::{SessionOrchestrator, SubmitMessage, SubmitOutcome};
pub use server::{AppState, ForemanServer, ServerHandle, ServerParts};
