//! Lenient recovery of JSON objects from model output, followed by strict
//! validation of the fields triage depends on.

use serde_json::{Map, Value};

use inbox_core::email::{is_valid_score, truncate_chars};
use inbox_core::ClassificationError;

const NOTIFICATION_MAX_CHARS: usize = 280;
const SUMMARY_MAX_ITEMS: usize = 3;

/// Scores and flags as returned by the classifier, already range-checked.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawScores {
    pub importance_score: f64,
    pub reply_needed_score: f64,
    pub importance: bool,
    pub reply_needed: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssistantGuidance {
    pub notification: String,
    pub summary: Vec<String>,
    pub reply_draft: String,
}

fn malformed(msg: impl Into<String>) -> ClassificationError {
    ClassificationError::MalformedResponse(msg.into())
}

pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    let inner = inner.trim_start();
    let inner = if inner.len() >= 4 && inner[..4].eq_ignore_ascii_case("json") {
        &inner[4..]
    } else {
        inner
    };
    inner.trim()
}

/// Escape raw line breaks that appear inside quoted strings. CR outside a
/// string is dropped; CRLF inside a string becomes a single `\n`.
pub fn escape_bare_newlines(snippet: &str) -> String {
    let mut out = String::with_capacity(snippet.len());
    let mut quote: Option<char> = None;
    let mut escape = false;
    let mut swallow_lf = false;

    for ch in snippet.chars() {
        if swallow_lf {
            swallow_lf = false;
            if ch == '\n' && quote.is_some() {
                continue;
            }
        }
        if escape {
            out.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' {
            out.push(ch);
            escape = true;
            continue;
        }
        match quote {
            Some(q) => match ch {
                c if c == q => {
                    quote = None;
                    out.push(c);
                }
                '\r' => {
                    out.push_str("\\n");
                    swallow_lf = true;
                }
                '\n' => out.push_str("\\n"),
                c => out.push(c),
            },
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '\r' => {}
                c => out.push(c),
            },
        }
    }
    out
}

/// First balanced `{...}` block in `text`.
pub fn find_json_block(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        return Some(&text[s..=idx]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover a JSON object from loosely formatted model output.
pub fn recover_object(text: &str) -> Result<Map<String, Value>, ClassificationError> {
    if text.trim().is_empty() {
        return Err(malformed("empty response from model"));
    }

    let cleaned = strip_code_fence(text)
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace('\u{2019}', "'");
    let cleaned = escape_bare_newlines(&cleaned);

    let mut candidates: Vec<&str> = Vec::with_capacity(2);
    if let Some(block) = find_json_block(&cleaned) {
        candidates.push(block);
    }
    candidates.push(&cleaned);

    for candidate in candidates {
        let snippet = candidate.trim();
        if snippet.is_empty() {
            continue;
        }
        let attempts = [snippet.to_string(), escape_bare_newlines(&snippet.replace('\'', "\""))];
        for attempt in &attempts {
            match serde_json::from_str::<Value>(attempt) {
                Ok(Value::Object(map)) => return Ok(map),
                Ok(_) => return Err(malformed("model output was not a JSON object")),
                Err(_) => continue,
            }
        }
    }
    Err(malformed(format!(
        "unable to recover JSON from model output: {}",
        truncate_chars(text.trim(), 200)
    )))
}

fn score(map: &Map<String, Value>, key: &str) -> Result<f64, ClassificationError> {
    let value = map.get(key).ok_or_else(|| malformed(format!("missing {key}")))?;
    let n = value
        .as_f64()
        .ok_or_else(|| malformed(format!("{key} is not numeric: {value}")))?;
    if !is_valid_score(n) {
        return Err(malformed(format!("{key} out of range: {n}")));
    }
    Ok(n)
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Parse classifier output. Missing, non-numeric or out-of-range scores
/// are `MalformedResponse`; nothing is clamped.
pub fn parse_scores(text: &str) -> Result<RawScores, ClassificationError> {
    let map = recover_object(text)?;
    Ok(RawScores {
        importance_score: score(&map, "importance_score")?,
        reply_needed_score: score(&map, "reply_needed_score")?,
        importance: flag(&map, "importance"),
        reply_needed: flag(&map, "reply_needed"),
    })
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn parse_assistant(text: &str, sender: &str) -> Result<AssistantGuidance, ClassificationError> {
    let map = recover_object(text)?;

    let mut notification = map
        .get("notification")
        .map(value_to_string)
        .unwrap_or_default()
        .trim()
        .to_string();
    if notification.is_empty() {
        notification = format!("You have an actionable email from {sender}.");
    }
    let notification = truncate_chars(&notification, NOTIFICATION_MAX_CHARS).to_string();

    let summary: Vec<String> = match map.get("summary") {
        Some(Value::String(s)) => s
            .lines()
            .map(|line| line.trim_matches(|c: char| " -*\u{2022}\t".contains(c)).to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| value_to_string(item).trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    Ok(AssistantGuidance {
        notification,
        summary: summary.into_iter().take(SUMMARY_MAX_ITEMS).collect(),
        reply_draft: map
            .get("reply_draft")
            .map(value_to_string)
            .unwrap_or_default()
            .trim()
            .to_string(),
    })
}

/// Deterministic guidance used when the assistant call fails.
pub fn fallback_guidance(sender: &str, subject: &str, snippet: &str, body: &str) -> AssistantGuidance {
    let source = if snippet.trim().is_empty() {
        truncate_chars(body, 180)
    } else {
        snippet
    };
    let source = source.trim();
    AssistantGuidance {
        notification: truncate_chars(
            &format!("You have an actionable email from {sender} about '{subject}'."),
            NOTIFICATION_MAX_CHARS,
        )
        .to_string(),
        summary: if source.is_empty() { Vec::new() } else { vec![source.to_string()] },
        reply_draft: String::new(),
    }
}
