use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use foreman_core::{Identity, Session, SessionId, SessionSettings, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};

const SESSION_COLUMNS: &str =
    "id, owner, project_ref, status, stream, created_at, last_activity";

/// Session records. Sessions are created lazily by [`crate::MessageRepo::append_user_turn`];
/// this repo has no way to create an empty one.
#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    /// Get a session, treating sessions owned by someone else as missing.
    #[instrument(skip(self), fields(session_id = %id, owner = %owner))]
    pub fn get_owned(&self, id: &SessionId, owner: &Identity) -> Result<Session, StoreError> {
        let session = self.get(id)?;
        if session.owner == *owner {
            Ok(session)
        } else {
            Err(StoreError::NotFound(format!("session {id}")))
        }
    }

    /// List an identity's sessions, most recently active first.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn list_for_owner(
        &self,
        owner: &Identity,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE owner = ?1
                 ORDER BY last_activity DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![owner.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Find the session lazily created by a given client message, if it was
    /// created at or after `not_before`. Older sessions no longer answer for
    /// their first message id, so a client reusing an id later starts fresh.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn find_by_origin(
        &self,
        owner: &Identity,
        client_message_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        self.db
            .with_conn(|conn| find_by_origin_in(conn, owner, client_message_id, not_before))
    }

    /// Record activity on a session.
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| touch_in(conn, id, Utc::now()))
    }

    /// Update session status. Closing is the only transition callers make directly.
    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.to_string(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            get_in(conn, id)
        })
    }

    /// Move `active` sessions with no activity since `cutoff` to `idle`.
    #[instrument(skip(self))]
    pub fn mark_idle(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET status = 'idle'
                 WHERE status = 'active' AND last_activity < ?1",
                [format_timestamp(cutoff)],
            )?)
        })
    }

    /// Number of sessions in a given status.
    pub fn count_by_status(&self, status: SessionStatus) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = ?1",
                [status.to_string()],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
    }
}

pub(crate) fn get_in(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

pub(crate) fn find_by_origin_in(
    conn: &Connection,
    owner: &Identity,
    client_message_id: &str,
    not_before: DateTime<Utc>,
) -> Result<Option<Session>, StoreError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE owner = ?1 AND origin_client_message_id = ?2",
            [owner.as_str(), client_message_id],
            |row| row.get(0),
        )
        .optional()?;
    let session = id.map(|id| get_in(conn, &SessionId::from_raw(id))).transpose()?;
    Ok(session.filter(|s| s.created_at >= not_before))
}

/// Drop an owner's claim on a first-message id so a new session can take it.
pub(crate) fn release_origin_in(
    conn: &Connection,
    owner: &Identity,
    client_message_id: &str,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE sessions SET origin_client_message_id = NULL
         WHERE owner = ?1 AND origin_client_message_id = ?2",
        [owner.as_str(), client_message_id],
    )?)
}

pub(crate) fn insert_in(
    conn: &Connection,
    session: &Session,
    origin_client_message_id: Option<&str>,
) -> Result<(), StoreError> {
    let _ = conn.execute(
        "INSERT INTO sessions (id, owner, project_ref, status, stream, origin_client_message_id, created_at, last_activity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            session.id.as_str(),
            session.owner.as_str(),
            session.project_ref,
            session.status.to_string(),
            session.settings.stream,
            origin_client_message_id,
            format_timestamp(session.created_at),
            format_timestamp(session.last_activity),
        ],
    )?;
    Ok(())
}

/// Record activity: bump `last_activity` and wake an idle session.
pub(crate) fn touch_in(conn: &Connection, id: &SessionId, now: DateTime<Utc>) -> Result<(), StoreError> {
    let _ = conn.execute(
        "UPDATE sessions SET last_activity = ?1,
                status = CASE status WHEN 'idle' THEN 'active' ELSE status END
         WHERE id = ?2",
        rusqlite::params![format_timestamp(now), id.as_str()],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status: String = row_helpers::get(row, 3, "sessions", "status")?;
    let created_at: String = row_helpers::get(row, 5, "sessions", "created_at")?;
    let last_activity: String = row_helpers::get(row, 6, "sessions", "last_activity")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        owner: Identity::new(row_helpers::get::<String>(row, 1, "sessions", "owner")?),
        project_ref: row_helpers::get_opt(row, 2, "sessions", "project_ref")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        settings: SessionSettings {
            stream: row_helpers::get(row, 4, "sessions", "stream")?,
        },
        created_at: row_helpers::parse_timestamp(&created_at, "sessions", "created_at")?,
        last_activity: row_helpers::parse_timestamp(&last_activity, "sessions", "last_activity")?,
    })
}
