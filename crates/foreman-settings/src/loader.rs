//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{ForemanSettings, LogFormat};

/// `~/.foreman`, or `/tmp/.foreman` when `HOME` is unset.
pub fn foreman_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".foreman")
}

/// Resolve the path to the settings file (`~/.foreman/settings.json`).
pub fn settings_path() -> PathBuf {
    foreman_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ForemanSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final
/// combination of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ForemanSettings> {
    let defaults = serde_json::to_value(ForemanSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ForemanSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Resolve the configured database path. Relative paths live under [`foreman_home`].
pub fn resolve_database_path(settings: &ForemanSettings) -> PathBuf {
    let configured = PathBuf::from(&settings.store.database_path);
    if configured.is_absolute() {
        configured
    } else {
        foreman_home().join(configured)
    }
}

/// Apply `FOREMAN_*` environment variable overrides.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides(settings: &mut ForemanSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("FOREMAN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("FOREMAN_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("FOREMAN_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("FOREMAN_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = read_env_usize("FOREMAN_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }

    // ── Chat ────────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("FOREMAN_MAX_CONTENT_CHARS", 1, 1_000_000) {
        settings.chat.max_content_chars = v;
    }
    if let Some(v) = read_env_u64("FOREMAN_IDLE_AFTER_SECS", 1, 604_800) {
        settings.chat.idle_after_secs = v;
    }

    // ── Rate limits ─────────────────────────────────────────────────
    if let Some(v) = read_env_u32("FOREMAN_MESSAGE_LIMIT", 1, 100_000) {
        settings.rate_limit.message_limit = v;
    }
    if let Some(v) = read_env_u64("FOREMAN_MESSAGE_WINDOW_SECS", 1, 86_400) {
        settings.rate_limit.message_window_secs = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("FOREMAN_DB_PATH") {
        settings.store.database_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("FOREMAN_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("FOREMAN_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "FOREMAN_LOG_FORMAT", value = %v, "invalid log format env var, ignoring"),
        }
    }
    if let Some(v) = read_env_bool("FOREMAN_LOG_PRETTY") {
        settings.logging.format = if v { LogFormat::Pretty } else { LogFormat::Json };
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse `json` or `pretty` (case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8787, "host": "127.0.0.1"}});
        let source = serde_json::json!({"server": {"port": 9000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9000);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_and_primitive_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3], "x": {"nested": true}}),
            serde_json::json!({"items": [4], "x": 42}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
        assert_eq!(merged["x"], 42);
    }

    #[test]
    fn merge_maps_add_keys() {
        let merged = deep_merge(
            serde_json::json!({"auth": {"tokens": {"a": "alice"}}}),
            serde_json::json!({"auth": {"tokens": {"b": "bob"}}}),
        );
        assert_eq!(merged["auth"]["tokens"]["a"], "alice");
        assert_eq!(merged["auth"]["tokens"]["b"], "bob");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, ForemanSettings::default().server.port);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"rateLimit": {"messageLimit": 3}, "auth": {"tokens": {"t1": "U1"}}, "logging": {"format": "pretty"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.rate_limit.message_limit, 3);
        assert_eq!(settings.rate_limit.message_window_secs, 60);
        assert_eq!(settings.auth.tokens.get("t1").map(String::as_str), Some("U1"));
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn load_rejects_invalid_combination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"heartbeatIntervalSecs": 60, "heartbeatTimeoutSecs": 10}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Invalid {
                field: "server.heartbeatTimeoutSecs",
                ..
            })
        ));
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let mut settings = ForemanSettings::default();
        settings.store.database_path = "/var/lib/foreman/chat.db".into();
        assert_eq!(
            resolve_database_path(&settings),
            PathBuf::from("/var/lib/foreman/chat.db")
        );
        settings.store.database_path = "chat.db".into();
        assert!(resolve_database_path(&settings).ends_with(".foreman/chat.db"));
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8787", 1, 65535), Some(8787));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u32_range("3", 1, 10), Some(3));
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range("abc", 0, 10), None);
    }

    #[test]
    fn parse_log_formats() {
        assert_eq!(parse_log_format("JSON"), Some(LogFormat::Json));
        assert_eq!(parse_log_format("pretty"), Some(LogFormat::Pretty));
        assert_eq!(parse_log_format("xml"), None);
    }
}
