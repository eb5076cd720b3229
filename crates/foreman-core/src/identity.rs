//! Verified caller identity.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

/// The verified caller on whose behalf an action is performed.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a verified identity string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the raw identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials presented by a connecting client.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// Bearer token from the `Authorization` header or `token` query parameter.
    pub bearer_token: Option<String>,
}

impl Credentials {
    /// Credentials carrying a bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }
}

/// Authentication collaborator: turns connection credentials into an identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify credentials, yielding the caller's identity.
    async fn verify(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
}
