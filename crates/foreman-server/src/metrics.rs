//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Frames dropped because a client's send queue was full (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// User messages handled (counter, labels: outcome = accepted | duplicate | rejected).
pub const CHAT_MESSAGES_TOTAL: &str = "chat_messages_total";
/// Requests rejected by the rate limiter (counter, labels: scope).
pub const CHAT_RATE_LIMITED_TOTAL: &str = "chat_rate_limited_total";
/// Assistant turns finished (counter, labels: status).
pub const CHAT_TURNS_TOTAL: &str = "chat_turns_total";
/// Assistant turn wall time (histogram).
pub const CHAT_TURN_DURATION_SECONDS: &str = "chat_turn_duration_seconds";
/// Text fragments persisted and relayed (counter).
pub const CHAT_FRAGMENTS_TOTAL: &str = "chat_fragments_total";
/// Turns that ended on a responder error (counter, labels: code).
pub const CHAT_RESPONDER_ERRORS_TOTAL: &str = "chat_responder_errors_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_BROADCAST_DROPS_TOTAL,
            CHAT_MESSAGES_TOTAL,
            CHAT_RATE_LIMITED_TOTAL,
            CHAT_TURNS_TOTAL,
            CHAT_TURN_DURATION_SECONDS,
            CHAT_FRAGMENTS_TOTAL,
            CHAT_RESPONDER_ERRORS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
