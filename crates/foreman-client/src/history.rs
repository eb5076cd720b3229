//! History queries over HTTP.
//!
//! After a reconnect the client re-fetches the finalized conversation here
//! instead of expecting the server to replay missed events.

use foreman_core::{Message, Session, SessionId};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    pub sessions: Vec<Session>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    detail: String,
}

#[derive(Clone, Debug)]
pub struct HistoryClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl HistoryClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base: config.http_base()?,
            token: config.token.clone(),
        })
    }

    pub async fn list_sessions(&self, limit: u32, offset: u32) -> Result<SessionList, ClientError> {
        let url = format!("{}/sessions?limit={limit}&offset={offset}", self.base);
        self.request(self.http.get(url)).await
    }

    pub async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
        offset: u32,
    ) -> Result<MessagePage, ClientError> {
        let url = format!(
            "{}/sessions/{session_id}/messages?limit={limit}&offset={offset}",
            self.base
        );
        self.request(self.http.get(url)).await
    }

    pub async fn close_session(&self, session_id: &SessionId) -> Result<Session, ClientError> {
        let url = format!("{}/sessions/{session_id}/close", self.base);
        self.request(self.http.post(url)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = builder.bearer_auth(&self.token).send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "history response");
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(api_error(status, &response.text().await.unwrap_or_default()))
    }
}

fn api_error(status: StatusCode, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { code, detail }) => ClientError::Api {
            status: status.as_u16(),
            code,
            detail,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            code: status
                .canonical_reason()
                .unwrap_or("UNKNOWN")
                .to_uppercase()
                .replace(' ', "_"),
            detail: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_error_body_is_kept() {
        let err = api_error(
            StatusCode::NOT_FOUND,
            r#"{"code":"NOT_FOUND","detail":"session not found: sess_1"}"#,
        );
        let ClientError::Api { status, code, detail } = err else {
            panic!("expected api error");
        };
        assert_eq!(status, 404);
        assert_eq!(code, "NOT_FOUND");
        assert_eq!(detail, "session not found: sess_1");
    }

    #[test]
    fn plain_error_body_falls_back_to_reason() {
        let err = api_error(StatusCode::BAD_GATEWAY, "upstream down");
        let ClientError::Api { code, detail, .. } = err else {
            panic!("expected api error");
        };
        assert_eq!(code, "BAD_GATEWAY");
        assert_eq!(detail, "upstream down");
    }

    #[test]
    fn base_url_comes_from_config() {
        let client = HistoryClient::new(&ClientConfig::new("ws://localhost:9", "t")).unwrap();
        assert_eq!(client.base, "http://localhost:9");
    }
}
