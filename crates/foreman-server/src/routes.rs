//! Query surface: session history and management over plain HTTP.
//!
//! Every route takes a bearer token and is charged against the caller's
//! read window.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use foreman_core::{ChatError, Identity, Message, Session, SessionId};

use crate::auth::credentials_from;
use crate::server::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

/// A [`ChatError`] rendered as `{ "code", "detail" }` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    detail: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::SessionClosed(_) => StatusCode::CONFLICT,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::ResponderFailure(_) | ChatError::TransportFailure(_) | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = Json(ErrorBody {
            code: self.0.code(),
            detail: self.0.to_string(),
        });
        let mut response = (status, body).into_response();
        if let ChatError::RateLimited { retry_after_secs } = self.0 {
            let _ = response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

/// `limit` / `offset` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct Page {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Page {
    fn resolve(&self) -> Result<(u32, u32), ChatError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE);
        if limit == 0 || limit > MAX_PAGE {
            return Err(ChatError::Validation(format!("limit must be 1-{MAX_PAGE}")));
        }
        Ok((limit, self.offset.unwrap_or(0)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    pub sessions: Vec<Session>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    pub limit: u32,
    pub offset: u32,
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let identity = state
        .verifier
        .verify(&credentials_from(headers, None))
        .await
        .map_err(ChatError::from)?;
    state.orchestrator.admit_read(&identity).await?;
    Ok(identity)
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Page>,
) -> Result<Json<SessionList>, ApiError> {
    let identity = authorize(&state, &headers).await?;
    let (limit, offset) = page.resolve()?;
    let sessions = state.orchestrator.list_sessions(&identity, limit, offset)?;
    Ok(Json(SessionList {
        sessions,
        limit,
        offset,
    }))
}

/// GET /sessions/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(page): Query<Page>,
) -> Result<Json<MessagePage>, ApiError> {
    let identity = authorize(&state, &headers).await?;
    let (limit, offset) = page.resolve()?;
    let session_id = SessionId::from_raw(session_id);
    let messages = state
        .orchestrator
        .fetch_messages(&identity, &session_id, limit, offset)?;
    Ok(Json(MessagePage {
        session_id,
        messages,
        limit,
        offset,
    }))
}

/// POST /sessions/{id}/close and DELETE /sessions/{id}.
///
/// Sessions are never hard-deleted; both routes close.
pub async fn close_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let identity = authorize(&state, &headers).await?;
    let session = state
        .orchestrator
        .close_session(&identity, &SessionId::from_raw(session_id))?;
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: ChatError) -> StatusCode {
        ApiError(e).status()
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(status_of(ChatError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ChatError::Unauthorized("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(ChatError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ChatError::SessionClosed("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ChatError::RateLimited { retry_after_secs: 3 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ChatError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn rate_limited_response_carries_retry_after() {
        let resp = ApiError(ChatError::RateLimited { retry_after_secs: 7 }).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "7");
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "RATE_LIMITED");
        assert!(json["detail"].is_string());
    }

    #[test]
    fn page_defaults_and_bounds() {
        assert_eq!(Page::default().resolve().unwrap(), (50, 0));
        let page = Page {
            limit: Some(10),
            offset: Some(20),
        };
        assert_eq!(page.resolve().unwrap(), (10, 20));
        for bad in [0, 201] {
            let page = Page {
                limit: Some(bad),
                offset: None,
            };
            assert!(page.resolve().is_err());
        }
    }
}
