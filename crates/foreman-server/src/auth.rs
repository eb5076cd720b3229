//! Bearer-token authentication for the WebSocket and HTTP surfaces.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use foreman_core::{AuthError, Credentials, Identity, IdentityVerifier};
use foreman_settings::AuthSettings;

/// Verifier backed by a fixed token → identity table from settings.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new<I, T, U>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, identity)| (token.into(), Identity::new(identity)))
                .collect(),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.tokens.iter().map(|(t, i)| (t.clone(), i.clone())))
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let token = credentials
            .bearer_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)
    }
}

/// Collect credentials from an `Authorization: Bearer` header, falling back
/// to a `token` query parameter (browsers cannot set headers on WebSocket upgrades).
pub fn credentials_from(headers: &HeaderMap, query_token: Option<&str>) -> Credentials {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    Credentials {
        bearer_token: header_token.or(query_token).map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn verifier() -> StaticTokenVerifier {
        StaticTokenVerifier::new([("tok-u1", "U1"), ("tok-u2", "U2")])
    }

    #[tokio::test]
    async fn known_token_yields_identity() {
        let id = verifier().verify(&Credentials::bearer("tok-u2")).await.unwrap();
        assert_eq!(id.as_str(), "U2");
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let err = verifier().verify(&Credentials::bearer("nope")).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[tokio::test]
    async fn missing_or_blank_token_is_missing() {
        let v = verifier();
        assert_eq!(
            v.verify(&Credentials::default()).await.unwrap_err(),
            AuthError::MissingCredentials
        );
        assert_eq!(
            v.verify(&Credentials::bearer("")).await.unwrap_err(),
            AuthError::MissingCredentials
        );
    }

    #[test]
    fn header_wins_over_query() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-u1"));
        let creds = credentials_from(&headers, Some("tok-u2"));
        assert_eq!(creds.bearer_token.as_deref(), Some("tok-u1"));
    }

    #[test]
    fn query_token_used_without_header() {
        let creds = credentials_from(&HeaderMap::new(), Some("tok-u2"));
        assert_eq!(creds.bearer_token.as_deref(), Some("tok-u2"));
        assert!(credentials_from(&HeaderMap::new(), None).bearer_token.is_none());
    }

    #[test]
    fn from_settings_reads_token_table() {
        let mut settings = AuthSettings::default();
        let _ = settings.tokens.insert("dev".into(), "alice".into());
        let v = StaticTokenVerifier::from_settings(&settings);
        assert!(!v.is_empty());
    }
}
