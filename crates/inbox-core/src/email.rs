use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ClassificationError;
use crate::ids::{MessageId, ThreadId};

/// Provider label fragments that mark a message as promotional.
pub const PROMOTION_LABEL_HINTS: &[&str] = &[
    "CATEGORY_PROMOTIONS",
    "SMARTLABEL_PROMO",
    "PROMOTION",
    "PROMO",
    "ADVERT",
];

/// A message as yielded by a mail source, before triage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: MessageId,
    pub thread_id: Option<ThreadId>,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    /// Provider receive time, epoch millis.
    pub internal_date: i64,
    pub is_unread: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl MailMessage {
    pub fn is_promotional(&self) -> bool {
        self.labels.iter().any(|label| {
            let upper = label.to_ascii_uppercase();
            PROMOTION_LABEL_HINTS.iter().any(|hint| upper.contains(hint))
        })
    }

    /// Header-plus-body text handed to a classifier, cut to `max_chars`.
    pub fn prompt_text(&self, max_chars: usize) -> String {
        let text = format!(
            "From: {}\nSubject: {}\n\n{}",
            self.sender, self.subject, self.body
        );
        truncate_chars(&text, max_chars).to_owned()
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Successful classifier output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Triage {
    pub importance_score: f64,
    pub reply_needed_score: f64,
    pub assistant_message: Option<String>,
    #[serde(default)]
    pub assistant_summary: Vec<String>,
    pub assistant_reply: Option<String>,
}

impl Triage {
    pub fn validate(&self) -> Result<(), ClassificationError> {
        check_score("importance_score", self.importance_score)?;
        check_score("reply_needed_score", self.reply_needed_score)
    }
}

fn check_score(field: &str, value: f64) -> Result<(), ClassificationError> {
    if is_valid_score(value) {
        Ok(())
    } else {
        Err(ClassificationError::MalformedResponse(format!(
            "{field} out of range: {value}"
        )))
    }
}

pub fn is_valid_score(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Persisted view of one provider message plus its triage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: MessageId,
    pub thread_id: Option<ThreadId>,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    pub internal_date: i64,
    pub is_unread: bool,
    pub importance_score: Option<f64>,
    pub reply_needed_score: Option<f64>,
    /// Derived on read from the reply threshold; ignored on write.
    #[serde(default)]
    pub is_actionable: bool,
    pub assistant_message: Option<String>,
    pub assistant_summary: Option<Vec<String>>,
    pub assistant_reply: Option<String>,
    pub classified_at: Option<DateTime<Utc>>,
}

impl EmailRecord {
    /// Record for a message whose triage failed or has not run yet.
    pub fn pending(msg: &MailMessage) -> Self {
        Self {
            id: msg.id.clone(),
            thread_id: msg.thread_id.clone(),
            sender: msg.sender.clone(),
            subject: msg.subject.clone(),
            snippet: msg.snippet.clone(),
            body: msg.body.clone(),
            internal_date: msg.internal_date,
            is_unread: msg.is_unread,
            importance_score: None,
            reply_needed_score: None,
            is_actionable: false,
            assistant_message: None,
            assistant_summary: None,
            assistant_reply: None,
            classified_at: None,
        }
    }

    pub fn classified(msg: &MailMessage, triage: Triage, at: DateTime<Utc>) -> Self {
        Self {
            importance_score: Some(triage.importance_score),
            reply_needed_score: Some(triage.reply_needed_score),
            assistant_message: triage.assistant_message,
            assistant_summary: Some(triage.assistant_summary),
            assistant_reply: triage.assistant_reply,
            classified_at: Some(at),
            ..Self::pending(msg)
        }
    }

    pub fn is_classified(&self) -> bool {
        self.classified_at.is_some()
    }

    /// Actionability under `threshold`. Pending records never qualify.
    pub fn actionable_at(&self, threshold: f64) -> bool {
        self.is_classified() && self.reply_needed_score.is_some_and(|s| s >= threshold)
    }
}
