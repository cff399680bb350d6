//! Gemini `generateContent` client implementing [`TriageClassifier`].
//!
//! Classification is a two-step exchange: a JSON scoring call, then (only
//! when the adjusted reply score crosses the actionability threshold) an
//! assistant call that drafts the notification and reply. A failed
//! assistant call degrades to a deterministic fallback instead of failing
//! the triage.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use inbox_core::email::truncate_chars;
use inbox_core::{ClassificationError, MailMessage, Triage, TriageClassifier};

use crate::heuristics::{self, EmailSignals};
use crate::parse::{self, AssistantGuidance};
use crate::prompt::{self, OwnerContext};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Character budget for email text sent to the model.
    pub context_chars: usize,
    /// Reply score at which the assistant call is made.
    pub reply_threshold: f64,
    pub owner: OwnerContext,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(45),
            context_chars: 12_000,
            reply_threshold: 0.6,
            owner: OwnerContext::default(),
        }
    }
}

/// Which of the three generation modes a request uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Classify,
    Assistant,
    Answer,
}

impl Mode {
    fn generation_config(self) -> GenerationConfig {
        match self {
            Self::Classify => GenerationConfig {
                temperature: 0.1,
                top_p: Some(0.9),
                top_k: Some(32),
                max_output_tokens: 512,
                response_mime_type: Some("application/json"),
            },
            Self::Assistant => GenerationConfig {
                temperature: 0.6,
                top_p: Some(0.9),
                top_k: Some(40),
                max_output_tokens: 640,
                response_mime_type: Some("application/json"),
            },
            Self::Answer => GenerationConfig {
                temperature: 0.3,
                top_p: None,
                top_k: None,
                max_output_tokens: 512,
                response_mime_type: None,
            },
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Text of the first candidate not blocked for safety.
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .filter(|c| c.finish_reason.as_deref() != Some("SAFETY"))
            .find_map(|c| {
                let text: String = c
                    .content?
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect();
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
    }
}

/// Parse an error body of the form `{"error": {"message": ...}}`.
fn api_error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {status}: {}", truncate_chars(body, 200)))
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ── Classifier ──────────────────────────────────────────────────────────────

pub struct GeminiClassifier {
    config: GeminiConfig,
    client: reqwest::Client,
    classifier_instruction: String,
}

impl GeminiClassifier {
    pub fn new(config: GeminiConfig) -> Result<Self, ClassificationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassificationError::Unavailable(format!("http client: {e}")))?;
        Ok(Self::with_client(config, client))
    }

    /// Create a classifier with a shared HTTP client.
    pub fn with_client(config: GeminiConfig, client: reqwest::Client) -> Self {
        info!(
            model = %config.model,
            has_api_key = config.api_key.is_some(),
            owner_configured = !config.owner.is_empty(),
            "gemini classifier initialized"
        );
        let classifier_instruction = prompt::classifier_instruction(&config.owner);
        Self {
            config,
            client,
            classifier_instruction,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn headers(&self) -> Result<HeaderMap, ClassificationError> {
        let key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| ClassificationError::Unavailable("GOOGLE_GENAI_API_KEY is not set".into()))?;
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut value = HeaderValue::from_str(key.expose_secret())
            .map_err(|e| ClassificationError::Unavailable(format!("invalid api key header: {e}")))?;
        value.set_sensitive(true);
        let _ = headers.insert(API_KEY_HEADER, value);
        Ok(headers)
    }

    #[instrument(skip_all, fields(model = %self.config.model, mode = ?mode))]
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        mode: Mode,
    ) -> Result<String, ClassificationError> {
        let headers = self.headers()?;
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![TextPart { text: system }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![TextPart { text: prompt }],
            }],
            generation_config: mode.generation_config(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "gemini request failed");
            if status.as_u16() == 429 {
                return Err(ClassificationError::RateLimited { retry_after });
            }
            return Err(ClassificationError::from_status(
                status.as_u16(),
                api_error_message(status.as_u16(), &text),
            ));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        let text = parsed
            .first_text()
            .ok_or_else(|| ClassificationError::MalformedResponse("no usable candidate in response".into()))?;
        debug!(chars = text.len(), "gemini response received");
        Ok(text)
    }

    fn transport_error(&self, err: reqwest::Error) -> ClassificationError {
        if err.is_timeout() {
            ClassificationError::Timeout(self.config.timeout)
        } else if err.is_decode() {
            ClassificationError::MalformedResponse(err.to_string())
        } else {
            ClassificationError::Unavailable(err.to_string())
        }
    }

    async fn assistant_guidance(&self, message: &MailMessage) -> AssistantGuidance {
        let body = truncate_chars(&message.body, self.config.context_chars);
        let prompt = prompt::assistant_prompt(&message.sender, &message.subject, body);
        let result = match self.generate(prompt::ASSISTANT_INSTRUCTION, &prompt, Mode::Assistant).await {
            Ok(text) => parse::parse_assistant(&text, &message.sender),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!(msg_id = %message.id, error = %e, "assistant guidance failed, using fallback");
            parse::fallback_guidance(&message.sender, &message.subject, &message.snippet, &message.body)
        })
    }
}

#[async_trait]
impl TriageClassifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(msg_id = %message.id))]
    async fn classify(&self, message: &MailMessage) -> Result<Triage, ClassificationError> {
        let email_text = message.prompt_text(self.config.context_chars);
        let prompt = prompt::classify_prompt(&email_text, &self.config.owner);
        let text = self
            .generate(&self.classifier_instruction, &prompt, Mode::Classify)
            .await?;
        let raw = parse::parse_scores(&text)?;

        let signals = EmailSignals {
            sender: &message.sender,
            subject: &message.subject,
            text: &email_text,
        };
        let scores = heuristics::adjust(raw, &signals, &self.config.owner, self.config.reply_threshold);
        debug!(
            importance = scores.importance_score,
            reply_needed = scores.reply_needed_score,
            raw_reply_needed = raw.reply_needed_score,
            "scores adjusted"
        );

        let mut triage = Triage {
            importance_score: scores.importance_score,
            reply_needed_score: scores.reply_needed_score,
            ..Triage::default()
        };
        if scores.reply_needed_score >= self.config.reply_threshold {
            let guidance = self.assistant_guidance(message).await;
            triage.assistant_message = Some(guidance.notification);
            triage.assistant_summary = guidance.summary;
            triage.assistant_reply = (!guidance.reply_draft.is_empty()).then_some(guidance.reply_draft);
        }
        triage.validate()?;
        Ok(triage)
    }

    async fn answer_free_text(
        &self,
        question: &str,
        context: &str,
    ) -> Result<String, ClassificationError> {
        let prompt = prompt::qa_prompt(question, context);
        self.generate(prompt::QA_INSTRUCTION, &prompt, Mode::Answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_core::ids::MessageId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLASSIFY_PATH: &str = "/v1beta/models/gemini-2.5-flash:generateContent";

    fn config(server: &MockServer) -> GeminiConfig {
        GeminiConfig {
            api_key: Some(SecretString::from("test-key")),
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            ..GeminiConfig::default()
        }
    }

    fn message(body: &str) -> MailMessage {
        MailMessage {
            id: MessageId::from_raw("m1"),
            thread_id: None,
            sender: "Ana <ana@example.com>".into(),
            subject: "Contract".into(),
            snippet: "Can you sign?".into(),
            body: body.into(),
            internal_date: 1_000,
            is_unread: true,
            labels: vec![],
        }
    }

    fn candidate(text: &str) -> serde_json::Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}, "finishReason": "STOP"}]})
    }

    #[tokio::test]
    async fn low_reply_score_skips_assistant_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CLASSIFY_PATH))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "generationConfig": {"responseMimeType": "application/json", "temperature": 0.1}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
                r#"{"importance_score": 0.2, "reply_needed_score": 0.1}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let triage = classifier.classify(&message("FYI, the report is attached.")).await.unwrap();
        assert_eq!(triage.reply_needed_score, 0.1);
        assert!(triage.assistant_message.is_none());
        assert!(triage.assistant_summary.is_empty());
    }

    #[tokio::test]
    async fn actionable_message_gets_assistant_guidance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CLASSIFY_PATH))
            .and(body_partial_json(json!({"generationConfig": {"temperature": 0.1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
                r#"{"importance_score": 0.7, "reply_needed_score": 0.9, "reply_needed": true}"#,
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CLASSIFY_PATH))
            .and(body_partial_json(json!({"generationConfig": {"temperature": 0.6}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
                r#"{"notification": "Ana needs your signature.", "summary": ["Sign contract"], "reply_draft": "Signed, thanks!"}"#,
            )))
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let triage = classifier.classify(&message("Can you sign today?")).await.unwrap();
        assert_eq!(triage.reply_needed_score, 0.9);
        assert_eq!(triage.importance_score, 0.9);
        assert_eq!(triage.assistant_message.as_deref(), Some("Ana needs your signature."));
        assert_eq!(triage.assistant_summary, vec!["Sign contract"]);
        assert_eq!(triage.assistant_reply.as_deref(), Some("Signed, thanks!"));
    }

    #[tokio::test]
    async fn failed_assistant_call_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"generationConfig": {"temperature": 0.1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
                r#"{"importance_score": 0.7, "reply_needed_score": 0.8}"#,
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"generationConfig": {"temperature": 0.6}})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let triage = classifier.classify(&message("Can you sign today?")).await.unwrap();
        assert_eq!(
            triage.assistant_message.as_deref(),
            Some("You have an actionable email from Ana <ana@example.com> about 'Contract'.")
        );
        assert_eq!(triage.assistant_summary, vec!["Can you sign?"]);
        assert!(triage.assistant_reply.is_none());
    }

    #[tokio::test]
    async fn out_of_range_score_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
                r#"{"importance_score": 0.5, "reply_needed_score": 1.7}"#,
            )))
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let err = classifier.classify(&message("hi")).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(json!({"error": {"message": "quota"}})),
            )
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let err = classifier.classify(&message("hi")).await.unwrap_err();
        assert_eq!(
            err,
            ClassificationError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})),
            )
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let err = classifier.classify(&message("hi")).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Unavailable(m) if m.contains("overloaded")));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(candidate("{}")),
            )
            .mount(&server)
            .await;

        let mut cfg = config(&server);
        cfg.timeout = Duration::from_millis(100);
        let classifier = GeminiClassifier::new(cfg).unwrap();
        let err = classifier.classify(&message("hi")).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn safety_blocked_candidates_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [
                    {"content": {"parts": [{"text": "blocked"}]}, "finishReason": "SAFETY"},
                    {"content": {"parts": [{"text": "Two emails mention the offsite."}]}, "finishReason": "STOP"}
                ]
            })))
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(config(&server)).unwrap();
        let answer = classifier
            .answer_free_text("What about the offsite?", "From: a\n---\n")
            .await
            .unwrap();
        assert_eq!(answer, "Two emails mention the offsite.");
    }

    #[tokio::test]
    async fn missing_api_key_is_unavailable() {
        let server = MockServer::start().await;
        let mut cfg = config(&server);
        cfg.api_key = None;
        let classifier = GeminiClassifier::new(cfg).unwrap();
        let err = classifier.answer_free_text("q", "ctx").await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[test]
    fn answer_mode_omits_json_mime_type() {
        let cfg = serde_json::to_value(Mode::Answer.generation_config()).unwrap();
        assert!(cfg.get("responseMimeType").is_none());
        assert_eq!(cfg["maxOutputTokens"], 512);
    }
}
