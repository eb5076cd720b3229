use std::time::Duration;

use foreman_core::{ClientInstanceId, SessionId};
use foreman_settings::ClientSettings;

use crate::error::ClientError;

/// Runtime configuration for a [`TransportManager`](crate::TransportManager)
/// and [`HistoryClient`](crate::HistoryClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL, `http(s)://host:port`.
    pub server_url: String,
    pub token: String,
    /// Stable per-tab/device id. A reconnect with the same id replaces the
    /// previous transport instead of adding one.
    pub client_id: ClientInstanceId,
    pub project_ref: Option<String>,
    pub outbox_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub typing_ttl: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::from_settings(
            &ClientSettings {
                server_url: server_url.into(),
                ..ClientSettings::default()
            },
            token,
        )
    }

    pub fn from_settings(settings: &ClientSettings, token: impl Into<String>) -> Self {
        Self {
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client_id: ClientInstanceId::new(),
            project_ref: None,
            outbox_capacity: settings.outbox_capacity.max(1),
            reconnect_base: Duration::from_millis(settings.reconnect_base_ms),
            reconnect_max: Duration::from_millis(settings.reconnect_max_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            typing_ttl: Duration::from_millis(settings.typing_ttl_ms),
        }
    }

    #[must_use]
    pub fn with_project(mut self, project_ref: impl Into<String>) -> Self {
        self.project_ref = Some(project_ref.into());
        self
    }

    /// WebSocket endpoint for this client, optionally resuming `session_id`.
    pub fn ws_url(&self, session_id: Option<&SessionId>) -> Result<String, ClientError> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://") {
            self.server_url.clone()
        } else {
            return Err(ClientError::InvalidUrl(self.server_url.clone()));
        };

        let mut url = format!(
            "{base}/ws?token={}&clientId={}",
            encode(&self.token),
            self.client_id
        );
        if let Some(sid) = session_id {
            url.push_str("&sessionId=");
            url.push_str(sid.as_str());
        }
        if let Some(project) = &self.project_ref {
            url.push_str("&projectId=");
            url.push_str(&encode(project));
        }
        Ok(url)
    }

    /// HTTP base URL for history queries.
    pub fn http_base(&self) -> Result<String, ClientError> {
        if let Some(rest) = self.server_url.strip_prefix("wss://") {
            Ok(format!("https://{rest}"))
        } else if let Some(rest) = self.server_url.strip_prefix("ws://") {
            Ok(format!("http://{rest}"))
        } else if self.server_url.starts_with("http://") || self.server_url.starts_with("https://") {
            Ok(self.server_url.clone())
        } else {
            Err(ClientError::InvalidUrl(self.server_url.clone()))
        }
    }
}

/// Percent-encode a query value (unreserved characters pass through).
fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(b));
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ClientConfig::from_settings(&ClientSettings::default(), "t");
        assert_eq!(cfg.server_url, "http://127.0.0.1:8787");
        assert_eq!(cfg.outbox_capacity, 64);
        assert_eq!(cfg.reconnect_base, Duration::from_millis(500));
        assert_eq!(cfg.reconnect_max, Duration::from_secs(30));
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert_eq!(cfg.typing_ttl, Duration::from_secs(3));
    }

    #[test]
    fn ws_url_swaps_scheme_and_carries_query() {
        let mut cfg = ClientConfig::new("http://localhost:9000/", "tok en").with_project("p-1");
        cfg.client_id = ClientInstanceId::from_raw("cli_a");
        let sid = SessionId::from_raw("sess_x");
        assert_eq!(
            cfg.ws_url(Some(&sid)).unwrap(),
            "ws://localhost:9000/ws?token=tok%20en&clientId=cli_a&sessionId=sess_x&projectId=p-1"
        );

        let tls = ClientConfig::new("https://chat.example.com", "t");
        assert!(tls.ws_url(None).unwrap().starts_with("wss://chat.example.com/ws?token=t"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let cfg = ClientConfig::new("ftp://host", "t");
        assert!(matches!(cfg.ws_url(None), Err(ClientError::InvalidUrl(_))));
        assert!(matches!(cfg.http_base(), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn http_base_from_ws_url() {
        assert_eq!(
            ClientConfig::new("ws://h:1", "t").http_base().unwrap(),
            "http://h:1"
        );
    }
}
