//! Connection registry: routes session events to every attached transport.
//!
//! The registry is ephemeral routing metadata. Sessions are looked up in the
//! store by id; the registry only maps those ids to whichever transports are
//! currently live.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};

use foreman_core::{ConnectionId, ServerEvent, SessionId};

use super::connection::ClientConnection;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;
use crate::orchestrator::EventSink;

/// Result of removing a connection.
pub struct Detached {
    pub connection: Arc<ClientConnection>,
    /// The session the connection was attached to, if any.
    pub session_id: Option<SessionId>,
    /// Transports still attached to that session.
    pub remaining: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    sessions: DashMap<SessionId, Vec<Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<ClientConnection>) {
        let _ = self.connections.insert(connection.id.clone(), connection);
    }

    /// Attach a registered connection to a session.
    ///
    /// If another transport of the same client instance is already attached
    /// (a reconnect racing the old socket's timeout), that transport is
    /// closed and returned.
    pub fn attach(
        &self,
        session_id: &SessionId,
        connection: &Arc<ClientConnection>,
    ) -> Option<Arc<ClientConnection>> {
        if let Some(previous) = connection.session_id() {
            if previous == *session_id {
                return None;
            }
            self.remove_from_session(&previous, &connection.id);
        }
        connection.bind_session(session_id.clone());

        let mut attached = self.sessions.entry(session_id.clone()).or_default();
        let replaced = connection.client_id.as_ref().and_then(|client_id| {
            let pos = attached.iter().position(|c| {
                c.id != connection.id
                    && c.identity == connection.identity
                    && c.client_id.as_ref() == Some(client_id)
            })?;
            Some(attached.remove(pos))
        });
        attached.push(Arc::clone(connection));
        let count = attached.len();
        drop(attached);

        if let Some(old) = &replaced {
            info!(session_id = %session_id, old_conn = %old.id, new_conn = %connection.id, "replacing stale transport");
            old.close();
        }
        debug!(session_id = %session_id, conn_id = %connection.id, attached = count, "transport attached");
        replaced
    }

    /// Forget a connection entirely.
    pub fn detach(&self, connection_id: &ConnectionId) -> Option<Detached> {
        let (_, connection) = self.connections.remove(connection_id)?;
        let session_id = connection.session_id();
        let remaining = session_id
            .as_ref()
            .map_or(0, |sid| self.remove_from_session(sid, connection_id));
        Some(Detached {
            connection,
            session_id,
            remaining,
        })
    }

    fn remove_from_session(&self, session_id: &SessionId, connection_id: &ConnectionId) -> usize {
        let mut remaining = 0;
        let _ = self.sessions.remove_if_mut(session_id, |_, attached| {
            attached.retain(|c| c.id != *connection_id);
            remaining = attached.len();
            attached.is_empty()
        });
        remaining
    }

    /// Deliver `event` to every transport attached to `session_id`, skipping
    /// `except`. Returns how many transports accepted the frame.
    ///
    /// Never waits on a transport. A transport whose queue is full misses a
    /// frame, so it is unrouted and told to close at once: its client
    /// reconnects and re-fetches history instead of seeing a stream with
    /// holes in it.
    pub fn publish(
        &self,
        session_id: &SessionId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event_type = event.type_name(), error = %e, "failed to serialize event");
                return 0;
            }
        };
        let recipients: Vec<Arc<ClientConnection>> = match self.sessions.get(session_id) {
            Some(attached) => attached.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for conn in recipients.iter().filter(|c| Some(&c.id) != except) {
            if conn.is_closing() {
                continue;
            }
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
                continue;
            }
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            warn!(
                conn_id = %conn.id,
                session_id = %session_id,
                event_type = event.type_name(),
                "transport fell behind; closing it"
            );
            conn.close();
            let _ = self.remove_from_session(session_id, &conn.id);
        }
        debug!(
            event_type = event.type_name(),
            session_id = %session_id,
            recipients = recipients.len(),
            delivered,
            "published session event"
        );
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn attached_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |a| a.len())
    }

    pub fn session_connections(&self, session_id: &SessionId) -> Vec<Arc<ClientConnection>> {
        self.sessions
            .get(session_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Close every live transport (used during shutdown).
    pub fn close_all(&self) {
        for entry in &self.connections {
            entry.value().close();
        }
    }
}

impl EventSink for ConnectionRegistry {
    fn publish(&self, session_id: &SessionId, event: &ServerEvent, except: Option<&ConnectionId>) {
        let _ = ConnectionRegistry::publish(self, session_id, event, except);
    }
}
