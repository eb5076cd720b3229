//! WebSocket session lifecycle: handles one connected client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use foreman_core::{
    ChatError, ClientEvent, ClientInstanceId, ConnectionId, Identity, ServerEvent, SessionId,
};

use super::connection::ClientConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use crate::orchestrator::SubmitMessage;
use crate::server::AppState;

/// How long cleanup waits for the writer to flush its close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// What the upgrade request told us about the client.
#[derive(Clone, Debug)]
pub struct WsParams {
    pub identity: Identity,
    /// Stable per-tab id; a reconnect with the same id replaces the old transport.
    pub client_id: Option<ClientInstanceId>,
    /// Session to resume. Absent until the first message creates one.
    pub session_id: Option<SessionId>,
    /// Project attached to a lazily created session.
    pub project_ref: Option<String>,
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection and sends `connected`
/// 2. Attaches to the requested session, if the identity owns it
/// 3. Forwards outbound frames from the connection's queue (single writer)
/// 4. Pings periodically and drops clients that stop answering
/// 5. Dispatches inbound client events to the orchestrator
/// 6. Detaches on exit and cancels the session's turns when the last
///    transport leaves
#[instrument(skip_all, fields(identity = %params.identity))]
pub async fn run_ws_session(socket: WebSocket, params: WsParams, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.send_queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(
        ConnectionId::new(),
        params.identity.clone(),
        params.client_id.clone(),
        send_tx,
    ));
    let conn_id = connection.id.clone();

    state.registry.register(Arc::clone(&connection));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(conn_id = %conn_id, client_id = ?params.client_id, "client connected");

    let resumed = params
        .session_id
        .as_ref()
        .and_then(|sid| match state.orchestrator.session(&params.identity, sid) {
            Ok(session) => Some(session.id),
            Err(e) => {
                let _ = connection.send_event(&ServerEvent::error(&e));
                None
            }
        });
    if let Some(sid) = &resumed {
        let _ = state.registry.attach(sid, &connection);
    }
    let _ = connection.send_event(&ServerEvent::Connected {
        session_id: resumed,
        connection_id: conn_id.clone(),
    });

    let closing = connection.closing();
    let writer_closing = closing.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = send_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(WsMessage::Text(String::clone(&frame).into())).await.is_err() {
                        break;
                    }
                }
                () = writer_closing.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let hb_conn = Arc::clone(&connection);
    let hb_cancel = closing.clone();
    let (interval, timeout) = (state.config.heartbeat_interval(), state.config.heartbeat_timeout());
    let heartbeat = tokio::spawn(async move {
        if run_heartbeat(Arc::clone(&hb_conn), interval, timeout, hb_cancel).await == HeartbeatResult::TimedOut {
            warn!(conn_id = %hb_conn.id, "client stopped answering pings");
            hb_conn.close();
        }
    });

    let shutdown = state.shutdown.token();
    loop {
        let frame = tokio::select! {
            () = closing.cancelled() => break,
            () = shutdown.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let Some(Ok(frame)) = frame else { break };
        connection.mark_alive();

        let text = match frame {
            WsMessage::Text(t) => t.to_string(),
            WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(conn_id = %conn_id, len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            WsMessage::Close(_) => {
                debug!(conn_id = %conn_id, "client sent close frame");
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };
        handle_frame(&state, &connection, &params, &text).await;
    }

    connection.close();
    heartbeat.abort();
    if let Some(detached) = state.registry.detach(&conn_id) {
        if let (Some(sid), 0) = (&detached.session_id, detached.remaining) {
            if state.orchestrator.cancel_session_turns(sid) {
                info!(session_id = %sid, "last transport left; cancelled in-flight turns");
            }
        }
    }
    let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        conn_id = %conn_id,
        duration_secs = connection.connected_at.elapsed().as_secs(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

async fn handle_frame(state: &AppState, connection: &Arc<ClientConnection>, params: &WsParams, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(conn_id = %connection.id, error = %e, "malformed client event");
            let err = ChatError::Validation(format!("malformed event: {e}"));
            let _ = connection.send_event(&ServerEvent::error(&err));
            return;
        }
    };

    match event {
        ClientEvent::Message {
            content,
            attachments,
            client_message_id,
            stream,
        } => {
            let request = SubmitMessage {
                session_id: connection.session_id(),
                project_ref: params.project_ref.clone(),
                content,
                attachments,
                client_message_id,
                stream,
            };
            submit(state, connection, request).await;
        }
        ClientEvent::Typing => {
            if let Some(sid) = connection.session_id() {
                let _ = state.registry.publish(
                    &sid,
                    &ServerEvent::Typing {
                        identity: connection.identity.clone(),
                    },
                    Some(&connection.id),
                );
            }
        }
        ClientEvent::Reaction {
            message_id,
            helpful,
            rating,
        } => {
            let result = match connection.session_id() {
                Some(sid) => state
                    .orchestrator
                    .record_reaction(&connection.identity, &sid, &message_id, helpful, rating)
                    .map(|_| ()),
                None => Err(ChatError::Validation("no session to react in yet".into())),
            };
            if let Err(e) = result {
                let _ = connection.send_event(&ServerEvent::error(&e));
            }
        }
        ClientEvent::Pong => {}
    }
}

async fn submit(state: &AppState, connection: &Arc<ClientConnection>, request: SubmitMessage) {
    let stream = request.stream;
    let outcome = match state
        .orchestrator
        .submit_user_message(&connection.identity, request)
        .await
    {
        Ok(o) => o,
        Err(e) => {
            let _ = connection.send_event(&ServerEvent::error(&e));
            return;
        }
    };
    let sid = outcome.session_id().clone();

    if connection.session_id().as_ref() != Some(&sid) {
        let _ = state.registry.attach(&sid, connection);
        let _ = connection.send_event(&ServerEvent::Connected {
            session_id: Some(sid.clone()),
            connection_id: connection.id.clone(),
        });
    }
    let _ = connection.send_event(&outcome.ack());
    if outcome.duplicate {
        return;
    }

    let _ = state.registry.publish(
        &sid,
        &ServerEvent::Message {
            message: outcome.message.clone(),
        },
        Some(&connection.id),
    );
    let turn = state
        .orchestrator
        .start_turn(sid, outcome.message.id.clone(), stream);
    state.shutdown.track(turn);
}
