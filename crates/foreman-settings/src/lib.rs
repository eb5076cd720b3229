//! # foreman-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ForemanSettings::default()`]
//! 2. **Settings file**: `~/.foreman/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**: `FOREMAN_*` overrides (highest priority)
//!
//! There is no global instance. The binary loads settings once and passes
//! the pieces each component needs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, foreman_home, load_settings, load_settings_from_path, resolve_database_path,
    settings_path,
};
pub use types::*;
