//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when the store could not be queried.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Live WebSocket transports.
    pub connections: usize,
    /// Sessions currently in the `active` state. `None` if the store failed.
    pub active_sessions: Option<u64>,
}

pub fn health_check(start_time: Instant, connections: usize, active_sessions: Option<u64>) -> HealthResponse {
    HealthResponse {
        status: if active_sessions.is_some() { "ok" } else { "degraded" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok_with_counts() {
        let resp = health_check(Instant::now(), 5, Some(3));
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.connections, 5);
        assert_eq!(resp.active_sessions, Some(3));
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn missing_session_count_is_degraded() {
        assert_eq!(health_check(Instant::now(), 0, None).status, "degraded");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, Some(0)).uptime_secs >= 59);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(health_check(Instant::now(), 2, Some(1))).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 2);
        assert_eq!(json["activeSessions"], 1);
        assert!(json["uptimeSecs"].is_number());
    }
}
