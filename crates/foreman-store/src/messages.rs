use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use foreman_core::{
    Attachment, Identity, Message, MessageId, MessageMetadata, MessageState, Reaction, Role,
    Session, SessionId, SessionSettings, SessionStatus,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};
use crate::sessions;

const MESSAGE_COLUMNS: &str = "id, session_id, sequence, role, content, attachments, client_message_id, \
     reply_to, state, fragment_count, latency_ms, incomplete, error, helpful, rating, reacted_at, created_at";

/// A user turn to append. `session_id = None` creates the session lazily.
#[derive(Clone, Debug)]
pub struct NewUserTurn {
    pub owner: Identity,
    pub session_id: Option<SessionId>,
    pub project_ref: Option<String>,
    pub settings: SessionSettings,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub client_message_id: Option<String>,
    /// Sessions created before this no longer deduplicate a session-less
    /// retry of their first message.
    pub retry_cutoff: DateTime<Utc>,
}

/// Result of appending a user turn.
#[derive(Clone, Debug)]
pub struct AppendOutcome {
    pub session: Session,
    pub message: Message,
    /// The session was created by this call.
    pub created_session: bool,
    /// The turn was already stored under the same client message id; nothing was written.
    pub duplicate: bool,
}

/// Terminal state for an assistant message.
#[derive(Clone, Debug)]
pub struct Finalize {
    pub state: MessageState,
    pub latency_ms: u64,
    pub incomplete: bool,
    pub error: Option<String>,
}

impl Finalize {
    /// Successful completion.
    pub fn complete(latency_ms: u64) -> Self {
        Self {
            state: MessageState::Complete,
            latency_ms,
            incomplete: false,
            error: None,
        }
    }

    /// Failure or cancellation; content stays as the truncated answer.
    pub fn errored(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            state: MessageState::Errored,
            latency_ms,
            incomplete: true,
            error: Some(error.into()),
        }
    }
}

/// Append-only message log, keyed by session.
///
/// Content is only ever extended while a message is `streaming`; once a
/// message is terminal the only permitted change is its reaction.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a user turn, creating its session if needed.
    ///
    /// Runs in one transaction:
    /// 1. Resolves the session (by id, or by the client message id that created it)
    /// 2. Returns the stored turn if `(session, client_message_id)` already exists
    /// 3. Otherwise allocates the next sequence number and inserts
    #[instrument(skip(self, turn), fields(owner = %turn.owner, session_id = ?turn.session_id))]
    pub fn append_user_turn(&self, turn: NewUserTurn) -> Result<AppendOutcome, StoreError> {
        self.db.transaction(|tx| {
            let now = Utc::now();

            let (session, created_session) = match &turn.session_id {
                Some(id) => {
                    let session = sessions::get_in(&tx, id)?;
                    if session.owner != turn.owner {
                        return Err(StoreError::NotFound(format!("session {id}")));
                    }
                    (session, false)
                }
                None => {
                    let existing = match &turn.client_message_id {
                        Some(cmid) => {
                            sessions::find_by_origin_in(&tx, &turn.owner, cmid, turn.retry_cutoff)?
                        }
                        None => None,
                    };
                    match existing {
                        Some(session) => (session, false),
                        None => {
                            if let Some(cmid) = &turn.client_message_id {
                                if sessions::release_origin_in(&tx, &turn.owner, cmid)? > 0 {
                                    debug!(owner = %turn.owner, "first-message id reused after the retry window");
                                }
                            }
                            let session = Session {
                                id: SessionId::new(),
                                owner: turn.owner.clone(),
                                project_ref: turn.project_ref.clone(),
                                status: SessionStatus::Active,
                                settings: turn.settings.clone(),
                                created_at: now,
                                last_activity: now,
                            };
                            sessions::insert_in(&tx, &session, turn.client_message_id.as_deref())?;
                            (session, true)
                        }
                    }
                }
            };

            if let Some(cmid) = &turn.client_message_id {
                if let Some(message) = find_by_client_id_in(&tx, &session.id, cmid)? {
                    debug!(session_id = %session.id, message_id = %message.id, "duplicate user turn");
                    return Ok(AppendOutcome {
                        session,
                        message,
                        created_session: false,
                        duplicate: true,
                    });
                }
            }

            if !session.status.accepts_messages() {
                return Err(StoreError::SessionClosed(session.id.to_string()));
            }

            let message = Message {
                id: MessageId::new(),
                session_id: session.id.clone(),
                sequence: next_sequence_in(&tx, &session.id)?,
                role: Role::User,
                content: turn.content,
                attachments: turn.attachments,
                client_message_id: turn.client_message_id,
                reply_to: None,
                state: MessageState::Complete,
                metadata: MessageMetadata::default(),
                reaction: None,
                created_at: now,
            };
            insert_in(&tx, &message)?;
            sessions::touch_in(&tx, &session.id, now)?;
            let session = sessions::get_in(&tx, &session.id)?;

            Ok(AppendOutcome {
                session,
                message,
                created_session,
                duplicate: false,
            })
        })
    }

    /// Create an assistant message in the `streaming` state.
    #[instrument(skip(self), fields(session_id = %session_id, reply_to = %reply_to))]
    pub fn begin_assistant(
        &self,
        session_id: &SessionId,
        reply_to: &MessageId,
    ) -> Result<Message, StoreError> {
        self.db.transaction(|tx| {
            let now = Utc::now();
            let message = Message {
                id: MessageId::new(),
                session_id: session_id.clone(),
                sequence: next_sequence_in(&tx, session_id)?,
                role: Role::Assistant,
                content: String::new(),
                attachments: Vec::new(),
                client_message_id: None,
                reply_to: Some(reply_to.clone()),
                state: MessageState::Streaming,
                metadata: MessageMetadata::default(),
                reaction: None,
                created_at: now,
            };
            insert_in(&tx, &message)?;
            sessions::touch_in(&tx, session_id, now)?;
            Ok(message)
        })
    }

    /// Append one fragment to a streaming message.
    ///
    /// The write only applies when `sequence_number` equals the number of
    /// fragments already stored, so a replayed or skipped fragment is a
    /// `Conflict` rather than a silent duplicate or gap.
    #[instrument(skip(self, text), fields(message_id = %message_id, seq = sequence_number))]
    pub fn append_fragment(
        &self,
        message_id: &MessageId,
        sequence_number: u64,
        text: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let expected = i64::try_from(sequence_number)
                .map_err(|_| StoreError::Conflict(format!("sequence {sequence_number} out of range")))?;
            let changed = conn.execute(
                "UPDATE messages SET content = content || ?1, fragment_count = fragment_count + 1
                 WHERE id = ?2 AND state = 'streaming' AND fragment_count = ?3",
                rusqlite::params![text, message_id.as_str(), expected],
            )?;
            if changed == 0 {
                let current = get_in(conn, message_id)?;
                return Err(StoreError::Conflict(format!(
                    "fragment {sequence_number} rejected for {message_id} (state {}, {} stored)",
                    current.state, current.metadata.fragment_count
                )));
            }
            Ok(())
        })
    }

    /// Move a streaming message to its terminal state.
    #[instrument(skip(self, outcome), fields(message_id = %message_id, state = %outcome.state))]
    pub fn finalize(&self, message_id: &MessageId, outcome: &Finalize) -> Result<Message, StoreError> {
        if !outcome.state.is_terminal() {
            return Err(StoreError::Conflict("cannot finalize into streaming".into()));
        }
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET state = ?1, latency_ms = ?2, incomplete = ?3, error = ?4
                 WHERE id = ?5 AND state = 'streaming'",
                rusqlite::params![
                    outcome.state.to_string(),
                    i64::try_from(outcome.latency_ms).unwrap_or(i64::MAX),
                    outcome.incomplete,
                    outcome.error,
                    message_id.as_str(),
                ],
            )?;
            let message = get_in(conn, message_id)?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "message {message_id} already {}",
                    message.state
                )));
            }
            Ok(message)
        })
    }

    /// Set the reaction on a message. Repeated calls overwrite; last writer wins.
    #[instrument(skip(self), fields(session_id = %session_id, message_id = %message_id))]
    pub fn record_reaction(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        helpful: Option<bool>,
        rating: Option<u8>,
    ) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET helpful = ?1, rating = ?2, reacted_at = ?3
                 WHERE id = ?4 AND session_id = ?5",
                rusqlite::params![
                    helpful,
                    rating,
                    format_timestamp(Utc::now()),
                    message_id.as_str(),
                    session_id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            get_in(conn, message_id)
        })
    }

    /// Get a message by ID.
    pub fn get(&self, message_id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| get_in(conn, message_id))
    }

    /// Look up a turn by its client-supplied idempotency key.
    pub fn find_by_client_id(
        &self,
        session_id: &SessionId,
        client_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        self.db
            .with_conn(|conn| find_by_client_id_in(conn, session_id, client_message_id))
    }

    /// Page through a session's log in order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1
                 ORDER BY sequence ASC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The last `n` completed turns of a session, oldest first.
    ///
    /// Errored and in-flight answers are left out so a truncated answer is
    /// never fed back to the responder as if it were finished.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn recent_context(&self, session_id: &SessionId, n: u32) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND state = 'complete'
                 ORDER BY sequence DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), n])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Mark every message left `streaming` by a previous process as errored.
    #[instrument(skip(self))]
    pub fn fail_orphaned_streams(&self, reason: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages SET state = 'errored', incomplete = 1, error = ?1
                 WHERE state = 'streaming'",
                [reason],
            )?)
        })
    }
}

fn next_sequence_in(conn: &Connection, session_id: &SessionId) -> Result<u64, StoreError> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM messages WHERE session_id = ?1",
        [session_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(max).unwrap_or_default() + 1)
}

fn insert_in(conn: &Connection, message: &Message) -> Result<(), StoreError> {
    let attachments = serde_json::to_string(&message.attachments)?;
    let _ = conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        rusqlite::params![
            message.id.as_str(),
            message.session_id.as_str(),
            i64::try_from(message.sequence).unwrap_or(i64::MAX),
            message.role.to_string(),
            message.content,
            attachments,
            message.client_message_id,
            message.reply_to.as_ref().map(MessageId::as_str),
            message.state.to_string(),
            0_i64,
            Option::<i64>::None,
            false,
            Option::<String>::None,
            Option::<bool>::None,
            Option::<u8>::None,
            Option::<String>::None,
            format_timestamp(message.created_at),
        ],
    )?;
    Ok(())
}

fn get_in(conn: &Connection, message_id: &MessageId) -> Result<Message, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let mut rows = stmt.query([message_id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_message(row),
        None => Err(StoreError::NotFound(format!("message {message_id}"))),
    }
}

fn find_by_client_id_in(
    conn: &Connection,
    session_id: &SessionId,
    client_message_id: &str,
) -> Result<Option<Message>, StoreError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM messages WHERE session_id = ?1 AND client_message_id = ?2",
            [session_id.as_str(), client_message_id],
            |row| row.get(0),
        )
        .optional()?;
    id.map(|id| get_in(conn, &MessageId::from_raw(id))).transpose()
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    const T: &str = "messages";
    let role: String = row_helpers::get(row, 3, T, "role")?;
    let attachments: String = row_helpers::get(row, 5, T, "attachments")?;
    let state: String = row_helpers::get(row, 8, T, "state")?;
    let created_at: String = row_helpers::get(row, 16, T, "created_at")?;
    let reacted_at: Option<String> = row_helpers::get_opt(row, 15, T, "reacted_at")?;

    let reaction = match reacted_at {
        Some(raw) => Some(Reaction {
            helpful: row_helpers::get_opt(row, 13, T, "helpful")?,
            rating: row_helpers::get_opt(row, 14, T, "rating")?,
            updated_at: row_helpers::parse_timestamp(&raw, T, "reacted_at")?,
        }),
        None => None,
    };

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        sequence: non_negative(row_helpers::get(row, 2, T, "sequence")?),
        role: row_helpers::parse_enum(&role, T, "role")?,
        content: row_helpers::get(row, 4, T, "content")?,
        attachments: row_helpers::parse_json(&attachments, T, "attachments")?,
        client_message_id: row_helpers::get_opt(row, 6, T, "client_message_id")?,
        reply_to: row_helpers::get_opt::<String>(row, 7, T, "reply_to")?.map(MessageId::from_raw),
        state: row_helpers::parse_enum(&state, T, "state")?,
        metadata: MessageMetadata {
            fragment_count: non_negative(row_helpers::get(row, 9, T, "fragment_count")?),
            latency_ms: row_helpers::get_opt::<i64>(row, 10, T, "latency_ms")?.map(non_negative),
            incomplete: row_helpers::get(row, 11, T, "incomplete")?,
            error: row_helpers::get_opt(row, 12, T, "error")?,
        },
        reaction,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
    })
}

fn non_negative(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}
