//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`InboxSettings::default()`]
//! 2. If `settings.json` exists in the home directory, deep-merge it over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::InboxSettings;

/// `$INBOX_BUDDY_HOME`, else `~/.inbox-buddy`.
pub fn home_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("INBOX_BUDDY_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".inbox-buddy")
}

pub fn settings_path() -> PathBuf {
    home_dir().join("settings.json")
}

/// Absolute paths pass through; relative ones land under `base`.
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

pub fn load_settings() -> Result<InboxSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<InboxSettings> {
    let defaults = serde_json::to_value(InboxSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: InboxSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

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

pub fn apply_env_overrides(settings: &mut InboxSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides_with(settings: &mut InboxSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup: &lookup };

    // ── Poll loop ───────────────────────────────────────────────────
    if let Some(v) = env.u64("POLL_INTERVAL", 5, 86_400) {
        settings.poll.interval_secs = v;
    }

    // ── Triage ──────────────────────────────────────────────────────
    if let Some(v) = env.f64("REPLY_NEEDED_THRESHOLD", 0.0, 1.0) {
        settings.triage.reply_needed_threshold = v;
    }
    if let Some(v) = env.u64("CLASSIFY_TIMEOUT", 1, 600) {
        settings.triage.classify_timeout_secs = v;
    }
    if let Some(v) = env.string("INBOX_OWNER_NAME") {
        settings.triage.owner_name = Some(v);
    }
    if let Some(v) = env.list("INBOX_OWNER_ALIASES") {
        settings.triage.owner_aliases = v;
    }

    // ── Gemini ──────────────────────────────────────────────────────
    if let Some(v) = env.string("GOOGLE_GENAI_MODEL") {
        settings.gemini.model = v;
    }
    if let Some(v) = env.string("GOOGLE_GENAI_API_KEY") {
        settings.gemini.api_key = Some(v);
    }
    if let Some(v) = env.string("GOOGLE_GENAI_BASE_URL") {
        settings.gemini.base_url = v;
    }

    // ── Gmail ───────────────────────────────────────────────────────
    if let Some(v) = env.string("GOOGLE_TOKEN_PATH") {
        settings.gmail.token_path = v;
    }
    if let Some(v) = env.string("GOOGLE_CREDENTIALS_PATH") {
        settings.gmail.credentials_path = v;
    }
    if let Some(v) = env.string("GMAIL_QUERY") {
        settings.gmail.query = v;
    }
    if let Some(v) = env.u64("GMAIL_MAX_MESSAGES", 1, 500) {
        settings.gmail.max_messages = v as usize;
    }
    if let Some(v) = env.string("GOOGLE_REDIRECT_URL") {
        settings.gmail.redirect_url = v;
    }

    // ── Server & storage ────────────────────────────────────────────
    if let Some(v) = env.string("INBOX_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("INBOX_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.list("CORS_ORIGINS") {
        settings.server.cors_origins = v;
    }
    if let Some(v) = env.string("INBOX_DB_PATH") {
        settings.storage.db_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LOG_LEVEL") {
        settings.logging.level = v.to_lowercase();
    }
    if let Some(v) = env.bool("LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

/// Comma separated, trimmed, empties dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|v| parse_list(&v))
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        let val = (self.lookup)(name)?;
        let result = parse_f64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid float env var, ignoring");
        }
        result
    }
}
