//! Client transport manager.
//!
//! One supervisor task owns the WebSocket. It flushes the outbox in FIFO
//! order, pumps inbound frames into the dispatcher, answers heartbeats, and
//! reconnects with capped exponential backoff whenever the connection is
//! lost without [`TransportManager::disconnect`] having been called.
//!
//! An event leaves the outbox only after the socket accepted it, so events
//! in flight when the connection drops are sent again after reconnecting.
//! Messages always carry a `clientMessageId`, which the server dedups on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foreman_core::{ChatError, ClientEvent, Identity, ServerEvent, SessionId};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{FragmentAssembler, PushOutcome};
use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::dispatch::{ClientUpdate, Dispatcher, EventKind, Notice};
use crate::error::ClientError;
use crate::typing::TypingTracker;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Where the transport currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect` has not been called yet.
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the given attempt.
    Reconnecting { attempt: u32 },
    /// Disconnected on purpose.
    Closed,
    /// Gave up reconnecting. `connect` may be called again.
    Failed,
}

enum PumpEnd {
    Intentional,
    Lost(String),
}

struct Shared {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    outbox: Mutex<VecDeque<ClientEvent>>,
    outbox_ready: Notify,
    session_id: Mutex<Option<SessionId>>,
    state: watch::Sender<ConnectionState>,
    assembler: Mutex<FragmentAssembler>,
    typing: TypingTracker,
    closing: CancellationToken,
    next_client_message: AtomicU64,
}

/// Owns one logical connection to a chat session.
pub struct TransportManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(config: ClientConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let typing = {
            let dispatcher = Arc::clone(&dispatcher);
            TypingTracker::new(config.typing_ttl, move |update| {
                dispatcher.emit(&ClientUpdate::Typing(update));
            })
        };
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                outbox: Mutex::new(VecDeque::new()),
                outbox_ready: Notify::new(),
                session_id: Mutex::new(None),
                state,
                assembler: Mutex::new(FragmentAssembler::new()),
                typing,
                closing: CancellationToken::new(),
                next_client_message: AtomicU64::new(1),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Register a handler. Handlers run on the transport task.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&ClientUpdate) + Send + Sync + 'static) {
        self.shared.dispatcher.on(kind, handler);
    }

    /// Start (or restart after `Failed`) the connection, optionally resuming
    /// `session_id`. Returns immediately; progress is visible via
    /// [`state`](Self::state) and `Notice`/`Connected` updates.
    pub fn connect(&self, session_id: Option<SessionId>) -> Result<(), ClientError> {
        if self.shared.closing.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if session_id.is_some() {
            *self.shared.session_id.lock() = session_id;
        }
        let _ = self.shared.state.send_replace(ConnectionState::Connecting);
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
        Ok(())
    }

    /// Queue an event. Accepted while disconnected; flushed in order once a
    /// connection is up. A `message` without a `clientMessageId` gets one.
    pub fn send(&self, mut event: ClientEvent) -> Result<(), ClientError> {
        if self.shared.closing.is_cancelled() {
            return Err(ClientError::Closed);
        }
        if let ClientEvent::Message {
            client_message_id: cmid @ None,
            ..
        } = &mut event
        {
            let n = self.shared.next_client_message.fetch_add(1, Ordering::Relaxed);
            *cmid = Some(format!("{}-{n}", self.shared.config.client_id));
        }
        {
            let mut outbox = self.shared.outbox.lock();
            let capacity = self.shared.config.outbox_capacity;
            if outbox.len() >= capacity {
                return Err(ClientError::QueueFull { capacity });
            }
            outbox.push_back(event);
        }
        self.shared.outbox_ready.notify_one();
        Ok(())
    }

    /// Close on purpose. No reconnect follows; queued events are discarded.
    pub async fn disconnect(&self) {
        self.shared.closing.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.outbox.lock().clear();
        let _ = self.shared.state.send_replace(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Session this client is bound to, learned from `connected`/`ack`.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.session_id.lock().clone()
    }

    /// Events waiting to be written.
    pub fn queued(&self) -> usize {
        self.shared.outbox.lock().len()
    }

    pub fn is_typing(&self, identity: &Identity) -> bool {
        self.shared.typing.is_typing(identity)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.shared.closing.cancel();
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

async fn supervise(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
    let mut connected_before = false;

    loop {
        let session = shared.session_id.lock().clone();
        let url = match config.ws_url(session.as_ref()) {
            Ok(url) => url,
            Err(e) => {
                shared.fail(&ChatError::TransportFailure(e.to_string()));
                return;
            }
        };

        let attempt = tokio::select! {
            () = shared.closing.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match attempt {
            Ok((ws, _response)) => {
                if connected_before {
                    info!(attempts = backoff.attempts(), "reconnected");
                    shared.emit(ClientUpdate::Notice(Notice::Reconnected {
                        attempts: backoff.attempts(),
                    }));
                } else {
                    info!("connected");
                }
                connected_before = true;
                backoff.reset();
                let _ = shared.state.send_replace(ConnectionState::Connected);

                let end = pump(&shared, ws).await;
                shared.transport_lost();
                match end {
                    PumpEnd::Intentional => break,
                    PumpEnd::Lost(reason) => {
                        warn!(%reason, "connection lost");
                        shared.emit(ClientUpdate::Notice(Notice::Disconnected { reason }));
                    }
                }
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                shared.fail(&ChatError::Unauthorized(format!(
                    "server refused credentials ({})",
                    response.status()
                )));
                return;
            }
            Err(e) => {
                warn!(attempt = backoff.attempts(), error = %e, "connect failed");
            }
        }

        if backoff.attempts() >= config.max_reconnect_attempts {
            shared.fail(&ChatError::TransportFailure(format!(
                "gave up after {} reconnect attempts",
                backoff.attempts()
            )));
            return;
        }
        let delay = backoff.next_delay();
        let _ = shared.state.send_replace(ConnectionState::Reconnecting {
            attempt: backoff.attempts(),
        });
        debug!(delay_ms = delay.as_millis(), "reconnect scheduled");
        tokio::select! {
            () = shared.closing.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    let _ = shared.state.send_replace(ConnectionState::Closed);
}

async fn pump(shared: &Shared, ws: WsStream) -> PumpEnd {
    let (mut sink, mut stream) = ws.split();
    loop {
        if let Err(e) = flush(shared, &mut sink).await {
            return PumpEnd::Lost(e.to_string());
        }
        tokio::select! {
            biased;
            () = shared.closing.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpEnd::Intentional;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = shared.handle_frame(text.as_str()) {
                        if let Err(e) = sink.send(Message::text(reply)).await {
                            return PumpEnd::Lost(e.to_string());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return PumpEnd::Lost("server closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
            },
            () = shared.outbox_ready.notified() => {}
        }
    }
}

async fn flush<S>(shared: &Shared, sink: &mut S) -> Result<(), tungstenite::Error>
where
    S: SinkExt<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let next = shared.outbox.lock().front().cloned();
        let Some(event) = next else {
            return Ok(());
        };
        match serde_json::to_string(&event) {
            Ok(text) => sink.send(Message::text(text)).await?,
            Err(e) => warn!(error = %e, kind = event.type_name(), "dropping unencodable event"),
        }
        let _ = shared.outbox.lock().pop_front();
    }
}

impl Shared {
    fn emit(&self, update: ClientUpdate) {
        self.dispatcher.emit(&update);
    }

    fn fail(&self, error: &ChatError) {
        warn!(error = %error, "transport failed");
        let _ = self.state.send_replace(ConnectionState::Failed);
        self.emit(ClientUpdate::Notice(Notice::Failed {
            code: error.code().to_string(),
            detail: error.to_string(),
        }));
    }

    fn transport_lost(&self) {
        let abandoned = self.assembler.lock().abandon_all();
        for message in abandoned {
            self.emit(ClientUpdate::Assembled(message));
        }
        self.typing.clear();
    }

    /// Apply one inbound frame. Returns a reply to write, if any.
    fn handle_frame(&self, text: &str) -> Option<String> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable server frame");
                return None;
            }
        };

        match &event {
            ServerEvent::Ping => return serde_json::to_string(&ClientEvent::Pong).ok(),
            ServerEvent::Connected { session_id, .. } => {
                (*self.session_id.lock()).clone_from(session_id);
            }
            ServerEvent::Ack { session_id, .. } => {
                *self.session_id.lock() = Some(session_id.clone());
            }
            ServerEvent::StreamStart {
                session_id,
                message_id,
            } => self.assembler.lock().start(session_id, message_id),
            ServerEvent::StreamChunk {
                message_id,
                sequence_number,
                content,
            } => {
                let outcome = {
                    let mut assembler = self.assembler.lock();
                    let session = assembler
                        .session_of(message_id)
                        .or_else(|| self.session_id.lock().clone());
                    session.map(|s| assembler.push(&s, message_id, *sequence_number, content))
                };
                if outcome == Some(PushOutcome::Duplicate) {
                    debug!(%message_id, sequence_number, "duplicate chunk ignored");
                    return None;
                }
            }
            ServerEvent::StreamEnd {
                message_id,
                metadata,
            } => {
                let assembled = {
                    let mut assembler = self.assembler.lock();
                    let session = assembler
                        .session_of(message_id)
                        .or_else(|| self.session_id.lock().clone());
                    session.map(|s| assembler.finish(&s, message_id, metadata))
                };
                self.emit(ClientUpdate::Server(event.clone()));
                if let Some(message) = assembled {
                    self.emit(ClientUpdate::Assembled(message));
                }
                return None;
            }
            ServerEvent::Typing { identity } => {
                self.typing.observe(identity);
                return None;
            }
            _ => {}
        }
        self.emit(ClientUpdate::Server(event));
        None
    }
}
