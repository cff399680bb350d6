use serde::Serialize;

use crate::email::EmailRecord;

/// Ephemeral notification fanned out to connected clients. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    ImportantEmail {
        #[serde(flatten)]
        email: Box<EmailRecord>,
        actionable: bool,
    },
    AuthRequired,
    Error {
        message: String,
    },
    Reset {
        deleted: u64,
    },
}

impl PushEvent {
    pub fn important(email: EmailRecord) -> Self {
        Self::ImportantEmail {
            actionable: email.is_actionable,
            email: Box::new(email),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ImportantEmail { .. } => "important_email",
            Self::AuthRequired => "auth_required",
            Self::Error { .. } => "error",
            Self::Reset { .. } => "reset",
        }
    }
}
