//! HTTP route handlers.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use inbox_core::EmailRecord;
use inbox_engine::reset_inbox;
use inbox_store::ListQuery;
use inbox_telemetry::{LogQuery, LogRecord};

use crate::error::ApiError;
use crate::server::AppState;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;
pub const DEFAULT_LOG_LIMIT: u32 = 100;
pub const MAX_LOG_LIMIT: u32 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct EmailsQuery {
    pub limit: Option<usize>,
    pub actionable_only: Option<bool>,
    pub collapse_threads: Option<bool>,
}

impl EmailsQuery {
    fn to_list_query(&self) -> ListQuery {
        ListQuery {
            limit: self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT),
            actionable_only: self.actionable_only.unwrap_or(true),
            collapse_threads: self.collapse_threads.unwrap_or(true),
        }
    }
}

pub async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<EmailsQuery>,
) -> Result<Json<Vec<EmailRecord>>, ApiError> {
    Ok(Json(state.repo.query(query.to_list_query())?))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
}

pub async fn ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let Some(question) = req.question else {
        return Err(ApiError::BadRequest("question is required".into()));
    };
    let answer = state.ask.ask(&question, req.limit).await?;
    Ok(Json(AskResponse { answer }))
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub deleted: u64,
}

pub async fn reset(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    let deleted = reset_inbox(&state.repo, &state.broadcaster, &state.poll)?;
    Ok(Json(ResetResponse { deleted }))
}

pub async fn auth_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    if state.authorizer.is_authenticated().await {
        return Ok(Json(serde_json::json!({ "already_authenticated": true })));
    }
    let url = state.authorizer.authorization_url().await?;
    Ok(Json(serde_json::json!({ "auth_url": url })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

pub async fn auth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(err) = query.error {
        warn!(error = %err, "authorization denied by provider");
        return callback_page(StatusCode::BAD_REQUEST, "Authorization failed", &err);
    }
    let (Some(auth_state), Some(code)) = (query.state, query.code) else {
        return callback_page(
            StatusCode::BAD_REQUEST,
            "Authorization failed",
            "missing state or code",
        );
    };

    match state.authorizer.complete(&auth_state, &code).await {
        Ok(()) => {
            info!("mail authorization completed");
            let _ = state.poll.trigger();
            callback_page(
                StatusCode::OK,
                "Authorization complete",
                "You can close this window.",
            )
        }
        Err(e) => {
            let err = ApiError::from(e);
            callback_page(err.status(), "Authorization failed", &err.to_string())
        }
    }
}

fn callback_page(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(detail)
    );
    (status, Html(body)).into_response()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Push events as server-sent events. No ids and no replay.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    let stream = subscription.filter_map(|event| async move {
        match Event::default().json_data(event.as_ref()) {
            Ok(e) => Some(Ok(e)),
            Err(err) => {
                warn!(error = %err, event_type = event.event_type(), "push event not serializable");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive))
}

/// Persisted warn+ log lines, newest first.
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state.logs.as_ref().ok_or(ApiError::LogsDisabled)?;
    let query = LogQuery {
        limit: Some(query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT)),
        ..query
    };
    let records = sink.query(&query).map_err(|e| ApiError::Logs(e.to_string()))?;
    Ok(Json(records))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let emails = state.repo.count()?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "subscribers": state.broadcaster.subscriber_count(),
        "emails": emails,
    })))
}
