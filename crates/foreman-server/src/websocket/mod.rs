//! WebSocket transports: per-connection state, session routing, heartbeat,
//! and the per-connection session loop.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;
