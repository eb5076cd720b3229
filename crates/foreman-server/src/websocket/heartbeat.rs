//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use foreman_core::ServerEvent;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped answering within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Send a `ping` event every `interval` and watch for answers.
///
/// Any inbound frame counts as an answer (see
/// [`ClientConnection::mark_alive`]). A tick that finds the client silent for
/// `timeout` or longer declares it dead, which catches half-open sockets
/// whose close notification never arrives.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let silent = connection.silent_for();
                if silent >= timeout {
                    debug!(conn_id = %connection.id, silent_ms = silent.as_millis(), "heartbeat timed out");
                    return HeartbeatResult::TimedOut;
                }
                let _ = connection.send_event(&ServerEvent::Ping);
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
