//! Gmail `users.messages` wire types and conversion to [`MailMessage`].

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

use inbox_core::ids::{MessageId, ThreadId};
use inbox_core::{AdapterError, MailMessage};

/// Gmail bodies are base64url; padding may or may not be present.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const HTML_WRAP_WIDTH: usize = 100;
const UNREAD_LABEL: &str = "UNREAD";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRef {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Epoch millis, sent as a decimal string.
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartBody {
    pub data: Option<String>,
}

impl MessagePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn data(&self) -> Option<&str> {
        self.body.as_ref()?.data.as_deref().filter(|d| !d.is_empty())
    }
}

pub fn decode_body(data: &str) -> Result<String, AdapterError> {
    let bytes = BODY_ENGINE
        .decode(data.trim())
        .map_err(|e| AdapterError::Decode(format!("body base64: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "html conversion failed, keeping markup");
            html.to_string()
        }
    }
}

fn collect_text(part: &MessagePart, plain: &mut Vec<String>, html: &mut Vec<String>) {
    if let Some(data) = part.data() {
        let mime = part.mime_type.to_ascii_lowercase();
        let target = if mime.starts_with("text/html") {
            Some(&mut *html)
        } else if mime.starts_with("text/plain") || mime.is_empty() {
            Some(&mut *plain)
        } else {
            None
        };
        if let Some(target) = target {
            match decode_body(data) {
                Ok(text) => target.push(text),
                Err(e) => warn!(mime = %part.mime_type, error = %e, "skipping undecodable part"),
            }
        }
    }
    for child in &part.parts {
        collect_text(child, plain, html);
    }
}

/// Body text, preferring `text/plain` parts and falling back to rendered
/// `text/html`.
pub fn extract_body(payload: &MessagePart) -> String {
    let mut plain = Vec::new();
    let mut html = Vec::new();
    collect_text(payload, &mut plain, &mut html);
    if !plain.is_empty() {
        return plain.join("\n");
    }
    html.iter()
        .map(|h| html_to_text(h))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

impl TryFrom<GmailMessage> for MailMessage {
    type Error = AdapterError;

    fn try_from(msg: GmailMessage) -> Result<Self, Self::Error> {
        let internal_date = msg
            .internal_date
            .as_deref()
            .ok_or_else(|| AdapterError::Decode(format!("message {} has no internalDate", msg.id)))?
            .parse::<i64>()
            .map_err(|e| AdapterError::Decode(format!("message {} internalDate: {e}", msg.id)))?;

        let payload = msg.payload.unwrap_or_default();
        Ok(MailMessage {
            id: MessageId::from_raw(msg.id),
            thread_id: msg.thread_id.map(ThreadId::from_raw),
            sender: payload.header("From").unwrap_or_default().to_string(),
            subject: payload.header("Subject").unwrap_or_default().to_string(),
            body: extract_body(&payload),
            snippet: msg.snippet,
            internal_date,
            is_unread: msg.label_ids.iter().any(|l| l == UNREAD_LABEL),
            labels: msg.label_ids,
        })
    }
}
