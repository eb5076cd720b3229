use foreman_core::ChatError;

/// Errors raised by the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ChatError::NotFound(what),
            StoreError::SessionClosed(what) => ChatError::SessionClosed(what),
            other => ChatError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found() {
        let e: ChatError = StoreError::NotFound("session sess_1".into()).into();
        assert_eq!(e, ChatError::NotFound("session sess_1".into()));
    }

    #[test]
    fn other_errors_map_to_internal() {
        let e: ChatError = StoreError::Conflict("dup".into()).into();
        assert_eq!(e.code(), "INTERNAL");
    }

    #[test]
    fn corrupt_row_display_names_location() {
        let e = StoreError::CorruptRow {
            table: "messages",
            column: "state",
            detail: "unknown variant: x".into(),
        };
        assert_eq!(e.to_string(), "corrupt row in messages.state: unknown variant: x");
    }
}
