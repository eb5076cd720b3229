//! Branded identifiers.
//!
//! Every durable or ephemeral entity gets its own newtype so a `MessageId`
//! can never be passed where a `SessionId` is expected. Values are
//! `<prefix>_<uuidv7>`, which keeps them sortable by creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for freshly generated values.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a new time-ordered identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an existing raw value (from the database or the wire).
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Durable conversation identifier.
    SessionId,
    "sess"
);
branded_id!(
    /// Server-assigned message identifier.
    MessageId,
    "msg"
);
branded_id!(
    /// Ephemeral transport identifier, unique per WebSocket.
    ConnectionId,
    "conn"
);
branded_id!(
    /// Stable identifier of one client instance (tab, device) across reconnects.
    ClientInstanceId,
    "cli"
);
