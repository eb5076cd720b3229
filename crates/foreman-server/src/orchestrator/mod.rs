//! Session orchestrator: turns inbound client events into persisted state
//! and outbound session events.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `assistant` | Persist-then-relay fragment stream for one assistant answer |
//! | `turn` | Per-session turn serialization, cancellation, and event relay |
//! | `sink` | Outbound event seam implemented by the connection registry |

mod assistant;
mod sink;
mod turn;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use foreman_core::{
    Attachment, ChatError, Identity, Message, MessageId, ServerEvent, Session, SessionId,
    SessionSettings, SessionStatus,
};
use foreman_llm::StreamingResponder;
use foreman_ratelimit::{LimitScope, RateLimiter};
use foreman_store::{AppendOutcome, Database, MessageRepo, NewUserTurn, SessionRepo};

use crate::config::ChatConfig;
use crate::metrics::{CHAT_MESSAGES_TOTAL, CHAT_RATE_LIMITED_TOTAL};

pub use assistant::AssistantStream;
pub use sink::EventSink;
use turn::SessionTurns;

#[cfg(test)]
pub(crate) use sink::recording::RecordingSink;

const MAX_CLIENT_MESSAGE_ID_LEN: usize = 128;

/// Collaborators the orchestrator is composed from.
pub struct OrchestratorDeps {
    pub db: Database,
    pub limiter: Arc<RateLimiter>,
    pub responder: StreamingResponder,
    pub sink: Arc<dyn EventSink>,
}

/// A user turn as received from a client.
#[derive(Clone, Debug)]
pub struct SubmitMessage {
    /// `None` creates the session with this message.
    pub session_id: Option<SessionId>,
    /// Project the session is about; only used when creating the session.
    pub project_ref: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Client idempotency key.
    ///
    /// Without a `session_id`, the key identifies the session this message
    /// created, but only for sessions created within
    /// [`ChatConfig::retry_window`]. Reusing a key after that starts a new
    /// session instead of returning the old one.
    pub client_message_id: Option<String>,
    /// Stream the answer as fragments.
    pub stream: bool,
}

impl SubmitMessage {
    pub fn new(session_id: Option<SessionId>, content: impl Into<String>) -> Self {
        Self {
            session_id,
            project_ref: None,
            content: content.into(),
            attachments: Vec::new(),
            client_message_id: None,
            stream: true,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_message_id: impl Into<String>) -> Self {
        self.client_message_id = Some(client_message_id.into());
        self
    }
}

/// Accepted (or recognized) user turn.
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub session: Session,
    pub message: Message,
    pub created_session: bool,
    /// A retry of an already-stored turn. Nothing new was written.
    pub duplicate: bool,
}

impl SubmitOutcome {
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message.id
    }

    /// `ack` event for the submitting transport.
    pub fn ack(&self) -> ServerEvent {
        ServerEvent::Ack {
            client_message_id: self.message.client_message_id.clone(),
            message_id: self.message.id.clone(),
            session_id: self.session.id.clone(),
            duplicate: self.duplicate,
        }
    }
}

impl From<AppendOutcome> for SubmitOutcome {
    fn from(o: AppendOutcome) -> Self {
        Self {
            session: o.session,
            message: o.message,
            created_session: o.created_session,
            duplicate: o.duplicate,
        }
    }
}

/// Single authority for session state changes.
///
/// Cheap to clone; clones share the store handle, limiter, responder, and
/// per-session turn state.
#[derive(Clone)]
pub struct SessionOrchestrator {
    sessions: SessionRepo,
    messages: MessageRepo,
    limiter: Arc<RateLimiter>,
    responder: StreamingResponder,
    sink: Arc<dyn EventSink>,
    config: ChatConfig,
    turns: Arc<DashMap<SessionId, Arc<SessionTurns>>>,
}

impl SessionOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: ChatConfig) -> Self {
        Self {
            sessions: SessionRepo::new(deps.db.clone()),
            messages: MessageRepo::new(deps.db),
            limiter: deps.limiter,
            responder: deps.responder,
            sink: deps.sink,
            config,
            turns: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Validate, deduplicate, rate limit, and persist a user turn.
    ///
    /// A retry carrying an already-stored `client_message_id` returns the
    /// original message with `duplicate = true` and does not consume a
    /// rate-limit slot. The insert itself also deduplicates, so concurrent
    /// retries still produce a single message.
    #[instrument(skip(self, request), fields(identity = %identity, session_id = ?request.session_id))]
    pub async fn submit_user_message(
        &self,
        identity: &Identity,
        request: SubmitMessage,
    ) -> Result<SubmitOutcome, ChatError> {
        if let Err(e) = self.validate(&request) {
            counter!(CHAT_MESSAGES_TOTAL, "outcome" => "rejected").increment(1);
            return Err(e);
        }

        let retry_cutoff = self.retry_cutoff();
        if let Some(existing) = self.find_existing(identity, &request, retry_cutoff)? {
            counter!(CHAT_MESSAGES_TOTAL, "outcome" => "duplicate").increment(1);
            debug!(message_id = %existing.message.id, "duplicate submission");
            return Ok(existing);
        }

        let decision = self.limiter.acquire_submit(identity).await;
        if !decision.admitted {
            counter!(CHAT_RATE_LIMITED_TOTAL, "scope" => LimitScope::Submit.as_str()).increment(1);
            return Err(ChatError::RateLimited {
                retry_after_secs: ceil_secs(decision.retry_after),
            });
        }

        let outcome: SubmitOutcome = self
            .messages
            .append_user_turn(NewUserTurn {
                owner: identity.clone(),
                session_id: request.session_id,
                project_ref: request.project_ref,
                settings: SessionSettings {
                    stream: request.stream,
                },
                content: request.content,
                attachments: request.attachments,
                client_message_id: request.client_message_id,
                retry_cutoff,
            })?
            .into();

        let label = if outcome.duplicate { "duplicate" } else { "accepted" };
        counter!(CHAT_MESSAGES_TOTAL, "outcome" => label).increment(1);
        info!(
            session_id = %outcome.session.id,
            message_id = %outcome.message.id,
            created_session = outcome.created_session,
            duplicate = outcome.duplicate,
            "user message accepted"
        );
        Ok(outcome)
    }

    fn retry_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.retry_window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn validate(&self, request: &SubmitMessage) -> Result<(), ChatError> {
        if request.content.trim().is_empty() {
            return Err(ChatError::Validation("message content is empty".into()));
        }
        let chars = request.content.chars().count();
        if chars > self.config.max_content_chars {
            return Err(ChatError::Validation(format!(
                "message is {chars} characters, the limit is {}",
                self.config.max_content_chars
            )));
        }
        if request.attachments.len() > self.config.max_attachments {
            return Err(ChatError::Validation(format!(
                "{} attachments, the limit is {}",
                request.attachments.len(),
                self.config.max_attachments
            )));
        }
        if request.attachments.iter().any(|a| a.id.trim().is_empty()) {
            return Err(ChatError::Validation("attachment id is empty".into()));
        }
        if let Some(id) = &request.client_message_id {
            if id.is_empty() || id.len() > MAX_CLIENT_MESSAGE_ID_LEN {
                return Err(ChatError::Validation(format!(
                    "clientMessageId must be 1-{MAX_CLIENT_MESSAGE_ID_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Ownership and status checks, plus the retry lookup.
    fn find_existing(
        &self,
        identity: &Identity,
        request: &SubmitMessage,
        retry_cutoff: DateTime<Utc>,
    ) -> Result<Option<SubmitOutcome>, ChatError> {
        let session = match &request.session_id {
            Some(id) => Some(self.sessions.get_owned(id, identity)?),
            None => match &request.client_message_id {
                Some(cmid) => self.sessions.find_by_origin(identity, cmid, retry_cutoff)?,
                None => None,
            },
        };
        let Some(session) = session else {
            return Ok(None);
        };

        if let Some(cmid) = &request.client_message_id {
            if let Some(message) = self.messages.find_by_client_id(&session.id, cmid)? {
                return Ok(Some(SubmitOutcome {
                    session,
                    message,
                    created_session: false,
                    duplicate: true,
                }));
            }
        }
        if !session.status.accepts_messages() {
            return Err(ChatError::SessionClosed(session.id.to_string()));
        }
        Ok(None)
    }

    /// Record feedback on a message and tell every attached transport.
    /// Last writer wins.
    #[instrument(skip(self), fields(identity = %identity, session_id = %session_id, message_id = %message_id))]
    pub fn record_reaction(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        message_id: &MessageId,
        helpful: Option<bool>,
        rating: Option<u8>,
    ) -> Result<Message, ChatError> {
        if let Some(r) = rating {
            if !(1..=5).contains(&r) {
                return Err(ChatError::Validation(format!("rating {r} is outside 1-5")));
            }
        }
        let _ = self.sessions.get_owned(session_id, identity)?;
        let message = self
            .messages
            .record_reaction(session_id, message_id, helpful, rating)?;
        self.sink.publish(
            session_id,
            &ServerEvent::Reaction {
                message_id: message_id.clone(),
                helpful,
                rating,
            },
            None,
        );
        Ok(message)
    }

    /// Close a session: it stays readable but rejects new messages. In-flight
    /// turns are cancelled.
    #[instrument(skip(self), fields(identity = %identity, session_id = %session_id))]
    pub fn close_session(&self, identity: &Identity, session_id: &SessionId) -> Result<Session, ChatError> {
        let current = self.sessions.get_owned(session_id, identity)?;
        let session = if current.status == SessionStatus::Closed {
            current
        } else {
            self.sessions.update_status(session_id, SessionStatus::Closed)?
        };
        let _ = self.cancel_session_turns(session_id);
        info!("session closed");
        Ok(session)
    }

    /// Cancel every in-flight or queued turn of a session. Later turns are
    /// unaffected. Returns whether anything was running.
    pub fn cancel_session_turns(&self, session_id: &SessionId) -> bool {
        match self.turns.get(session_id) {
            Some(turns) => {
                turns.cancel();
                debug!(session_id = %session_id, "cancelled session turns");
                true
            }
            None => false,
        }
    }

    /// Number of sessions with a turn in flight or queued.
    pub fn busy_sessions(&self) -> usize {
        self.turns.len()
    }

    /// Charge one read against the identity's read window. Fails open.
    pub async fn admit_read(&self, identity: &Identity) -> Result<(), ChatError> {
        let decision = self.limiter.acquire_read(identity).await;
        if decision.admitted {
            Ok(())
        } else {
            counter!(CHAT_RATE_LIMITED_TOTAL, "scope" => LimitScope::Read.as_str()).increment(1);
            Err(ChatError::RateLimited {
                retry_after_secs: ceil_secs(decision.retry_after),
            })
        }
    }

    /// An identity's sessions, most recently active first.
    pub fn list_sessions(&self, identity: &Identity, limit: u32, offset: u32) -> Result<Vec<Session>, ChatError> {
        Ok(self.sessions.list_for_owner(identity, limit, offset)?)
    }

    /// One page of a session's log, in order.
    pub fn fetch_messages(
        &self,
        identity: &Identity,
        session_id: &SessionId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, ChatError> {
        let _ = self.sessions.get_owned(session_id, identity)?;
        Ok(self.messages.list(session_id, limit, offset)?)
    }

    /// Load a session the identity owns.
    pub fn session(&self, identity: &Identity, session_id: &SessionId) -> Result<Session, ChatError> {
        Ok(self.sessions.get_owned(session_id, identity)?)
    }

    pub fn active_session_count(&self) -> Result<u64, ChatError> {
        Ok(self.sessions.count_by_status(SessionStatus::Active)?)
    }

    /// Mark sessions without activity for `idle_after` as idle.
    pub fn sweep_idle(&self, idle_after: Duration) -> Result<usize, ChatError> {
        let idle_after = chrono::Duration::from_std(idle_after)
            .map_err(|e| ChatError::Internal(format!("idle period out of range: {e}")))?;
        let marked = self.sessions.mark_idle(chrono::Utc::now() - idle_after)?;
        if marked > 0 {
            info!(marked, "sessions marked idle");
        }
        Ok(marked)
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `every` until `cancel` fires.
    pub fn spawn_idle_sweeper(
        &self,
        every: Duration,
        idle_after: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.sweep_idle(idle_after) {
                            warn!(error = %e, "idle sweep failed");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Finalize answers left `streaming` by a previous process.
    pub fn recover_interrupted_turns(&self) -> Result<usize, ChatError> {
        let failed = self
            .messages
            .fail_orphaned_streams("interrupted by server restart")?;
        if failed > 0 {
            warn!(failed, "finalized answers interrupted by a restart");
        }
        Ok(failed)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    (d.as_secs() + u64::from(d.subsec_nanos() > 0)).max(1)
}
