//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not valid settings JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Defaults merged with the file no longer fit the settings shape.
    #[error("merged settings do not deserialize: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_names_the_file() {
        let source = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err = SettingsError::Parse {
            path: PathBuf::from("/tmp/settings.json"),
            source,
        };
        assert!(err.to_string().starts_with("/tmp/settings.json is not valid settings JSON"));
    }

    #[test]
    fn invalid_names_the_field() {
        let err = SettingsError::Invalid {
            field: "server.sendQueueCapacity",
            reason: "must be positive",
        };
        assert_eq!(err.to_string(), "server.sendQueueCapacity: must be positive");
    }
}
