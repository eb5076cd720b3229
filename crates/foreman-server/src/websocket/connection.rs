//! Per-transport connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use foreman_core::{ClientInstanceId, ConnectionId, Identity, ServerEvent, SessionId};

/// One live WebSocket transport.
///
/// All frames for the socket go through `tx`, drained by a single writer
/// task, so frames are never interleaved.
pub struct ClientConnection {
    pub id: ConnectionId,
    pub identity: Identity,
    /// Stable id of the client install/tab, if the client sent one.
    pub client_id: Option<ClientInstanceId>,
    session_id: Mutex<Option<SessionId>>,
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    /// When the client last sent anything, pong or otherwise.
    last_seen: Mutex<Instant>,
    pub dropped_messages: AtomicU64,
    closing: CancellationToken,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        client_id: Option<ClientInstanceId>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            client_id,
            session_id: Mutex::new(None),
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closing: CancellationToken::new(),
        }
    }

    pub fn bind_session(&self, session_id: SessionId) {
        *self.session_id.lock() = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Queue a frame without waiting. Returns `false` and counts a drop when
    /// the queue is full or the writer is gone.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue an event for this connection only.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, event_type = event.type_name(), error = %e, "failed to serialize event");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record an inbound frame.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or since connecting).
    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Ask the connection's own task to shut the socket down.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Token cancelled by [`close`](Self::close).
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(
            ConnectionId::from_raw("conn_1"),
            Identity::new("U1"),
            Some(ClientInstanceId::from_raw("cli_a")),
            tx,
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn send_event_serializes_wire_json() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.send_event(&ServerEvent::Ping));
        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping"}));
    }

    #[test]
    fn full_queue_counts_drops() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert!(!conn.send(Arc::new("c".into())));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_writer_counts_drop() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert!(!conn.send(Arc::new("a".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_measured_from_last_inbound_frame() {
        let (conn, _rx) = make_connection(1);
        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(conn.silent_for(), Duration::from_secs(25));

        conn.mark_alive();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(conn.silent_for(), Duration::from_secs(4));
        assert_eq!(conn.connected_at.elapsed(), Duration::from_secs(29));
    }

    #[test]
    fn bind_and_rebind_session() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.session_id().is_none());
        conn.bind_session(SessionId::from_raw("sess_1"));
        conn.bind_session(SessionId::from_raw("sess_2"));
        assert_eq!(conn.session_id().unwrap().as_str(), "sess_2");
    }

    #[test]
    fn close_cancels_token() {
        let (conn, _rx) = make_connection(1);
        let token = conn.closing();
        assert!(!conn.is_closing());
        conn.close();
        assert!(token.is_cancelled());
        assert!(conn.is_closing());
    }
}
