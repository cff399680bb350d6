use std::time::Duration;

use crate::ids::MessageId;

/// Per-message triage failure. The message stays pending and is retried on
/// a later poll cycle; the pipeline never aborts on one of these.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ClassificationError {
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

impl ClassificationError {
    /// Short classification string for logging and push events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Map a non-success HTTP status from a model vendor.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            408 | 504 => Self::Timeout(Duration::ZERO),
            _ => Self::Unavailable(format!("status {status}: {body}")),
        }
    }
}

/// Mail provider failure.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("mail provider authentication required")]
    AuthRequired,
    #[error("network error: {0}")]
    Network(String),
    #[error("mail provider error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    /// One message could not be fetched or decoded; the rest of the
    /// stream is unaffected.
    #[error("message {id} unreadable: {reason}")]
    Unreadable { id: MessageId, reason: String },
}

impl AdapterError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthRequired,
            _ => Self::Api { status, body },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }

    /// Narrow a failure fetching message `id` to that message alone when
    /// retrying the whole stream would not help.
    pub fn for_message(self, id: &MessageId) -> Self {
        match self {
            Self::Decode(reason) => Self::Unreadable { id: id.clone(), reason },
            Self::Api { status: 404, body } => Self::Unreadable {
                id: id.clone(),
                reason: format!("not found: {body}"),
            },
            other => other,
        }
    }
}
