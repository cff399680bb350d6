//! Settings tree. Every section is `#[serde(default)]` so a partial file
//! only overrides what it names.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboxSettings {
    pub poll: PollSettings,
    pub triage: TriageSettings,
    pub gemini: GeminiSettings,
    pub gmail: GmailSettings,
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl InboxSettings {
    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = self.triage.reply_needed_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(SettingsError::InvalidValue(format!(
                "triage.replyNeededThreshold must be within [0, 1], got {t}"
            )));
        }
        if self.poll.interval_secs == 0 {
            return Err(SettingsError::InvalidValue("poll.intervalSecs must be > 0".into()));
        }
        if self.triage.classify_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "triage.classifyTimeoutSecs must be > 0".into(),
            ));
        }
        if self.server.subscriber_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.subscriberBuffer must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    pub interval_secs: u64,
    /// Delay before the first cycle after startup.
    pub initial_delay_secs: u64,
    /// Window in which repeated `auth_required` events are suppressed.
    pub auth_suppression_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            initial_delay_secs: 3,
            auth_suppression_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriageSettings {
    pub reply_needed_threshold: f64,
    pub classify_timeout_secs: u64,
    /// Character budget for the email text sent to the model.
    pub context_chars: usize,
    pub owner_name: Option<String>,
    pub owner_aliases: Vec<String>,
    /// Default number of records packed into an ask context.
    pub ask_limit: usize,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            reply_needed_threshold: 0.6,
            classify_timeout_secs: 45,
            context_chars: 12_000,
            owner_name: None,
            owner_aliases: Vec::new(),
            ask_limit: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeminiSettings {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailSettings {
    /// Relative paths resolve against the inbox-buddy home directory.
    pub token_path: String,
    pub credentials_path: String,
    /// Lookback query used for every fetch.
    pub query: String,
    pub max_messages: usize,
    /// Where Google sends the user after consent.
    pub redirect_url: String,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            token_path: "token.json".to_string(),
            credentials_path: "credentials.json".to_string(),
            query: "newer_than:7d".to_string(),
            max_messages: 50,
            redirect_url: "http://localhost:8000/auth/callback".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Per-subscriber event buffer for `/events`.
    pub subscriber_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:5173".to_string()],
            subscriber_buffer: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "inbox.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist warn+ events into the database `logs` table.
    pub db_sink: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            db_sink: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = InboxSettings::default();
        assert_eq!(s.poll.interval_secs, 120);
        assert!((s.triage.reply_needed_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(s.triage.classify_timeout_secs, 45);
        assert_eq!(s.gemini.model, "gemini-2.5-flash");
        assert_eq!(s.server.subscriber_buffer, 64);
        assert_eq!(s.gmail.query, "newer_than:7d");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(InboxSettings::default()).unwrap();
        assert_eq!(v["poll"]["intervalSecs"], 120);
        assert_eq!(v["triage"]["replyNeededThreshold"], 0.6);
        assert!(v["gemini"].get("apiKey").is_none());
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut s = InboxSettings::default();
        s.triage.reply_needed_threshold = 1.5;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let mut s = InboxSettings::default();
        s.server.subscriber_buffer = 0;
        assert!(s.validate().is_err());
    }
}
