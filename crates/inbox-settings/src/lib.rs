//! # inbox-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`InboxSettings::default()`]
//! 2. **User file**: `~/.inbox-buddy/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `POLL_INTERVAL`, `GOOGLE_GENAI_*`, ... (highest priority)
//!
//! The loaded value is immutable and passed explicitly to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, home_dir, load_settings, load_settings_from_path,
    resolve_path, settings_path,
};
pub use types::*;
