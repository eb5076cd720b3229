/// SQL DDL for the foreman store.
/// Timestamps are RFC 3339 UTC with millisecond precision, so text order is time order.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    project_ref TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    stream INTEGER NOT NULL DEFAULT 1,
    origin_client_message_id TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    sequence INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    attachments TEXT NOT NULL DEFAULT '[]',
    client_message_id TEXT,
    reply_to TEXT,
    state TEXT NOT NULL,
    fragment_count INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER,
    incomplete INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    helpful INTEGER,
    rating INTEGER,
    reacted_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (session_id, sequence)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_origin
    ON sessions(owner, origin_client_message_id)
    WHERE origin_client_message_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_id
    ON messages(session_id, client_message_id)
    WHERE client_message_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner, last_activity);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, last_activity);
CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(state);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
