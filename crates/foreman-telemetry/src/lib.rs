//! # foreman-telemetry
//!
//! One-call `tracing` setup: a JSON (or pretty) `fmt` layer filtered by an
//! [`EnvFilter`] built from settings. `RUST_LOG` wins over both.

#![deny(unsafe_code)]

use std::fmt::Write as _;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use foreman_settings::{LogFormat, LoggingSettings};

/// Errors from [`init_telemetry`].
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Per-module level overrides (e.g. `foreman_store` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            module_levels: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Build from the logging settings section. Unknown level names fall back to INFO.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            format: settings.format,
            module_levels: settings
                .module_levels
                .iter()
                .filter_map(|(module, level)| {
                    Level::from_str(level).ok().map(|l| (module.clone(), l))
                })
                .collect(),
        }
    }

    /// `EnvFilter` directives for this config, e.g. `info,foreman_store=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            let _ = write!(filter, ",{module}={}", level.to_string().to_lowercase());
        }
        filter
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            level: Level::WARN,
            format: LogFormat::Json,
            module_levels: vec![
                ("foreman_store".into(), Level::DEBUG),
                ("foreman_server::websocket".into(), Level::TRACE),
            ],
        };
        assert_eq!(
            config.filter_directives(),
            "warn,foreman_store=debug,foreman_server::websocket=trace"
        );
    }

    #[test]
    fn from_settings_skips_bad_levels() {
        let mut module_levels = BTreeMap::new();
        let _ = module_levels.insert("foreman_llm".to_string(), "debug".to_string());
        let _ = module_levels.insert("foreman_store".to_string(), "loud".to_string());
        let settings = LoggingSettings {
            level: "nonsense".into(),
            format: LogFormat::Pretty,
            module_levels,
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.module_levels, vec![("foreman_llm".to_string(), Level::DEBUG)]);
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(matches!(init_telemetry(&config), Err(TelemetryError::Init(_))));
    }
}
