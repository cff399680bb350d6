use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, instrument};

use inbox_core::ids::MessageId;
use inbox_core::{AdapterError, Cursor, MailMessage, MailSource, MessageStream};

use crate::auth::GoogleAuth;
use crate::payload::{GmailMessage, ListResponse};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com";

/// Gmail caps `maxResults` per page at 500.
const PAGE_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct GmailConfig {
    pub api_base: String,
    /// Search used for every fetch; a warm cursor appends `after:`.
    pub query: String,
    pub max_messages: usize,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            query: "newer_than:7d".to_string(),
            max_messages: 50,
        }
    }
}

impl GmailConfig {
    /// Search string for a fetch from `cursor`. Gmail's `after:` has
    /// second granularity, so the exact cut is re-applied client side.
    pub fn query_for(&self, cursor: Cursor) -> String {
        let base = self.query.trim();
        if cursor.is_cold() {
            return base.to_string();
        }
        let after = format!("after:{}", cursor.millis() / 1000);
        if base.is_empty() {
            after
        } else {
            format!("{base} {after}")
        }
    }
}

/// Issues authenticated calls against `users/me/messages`.
#[derive(Clone)]
struct Api {
    http: reqwest::Client,
    base: String,
    token: SecretString,
}

impl Api {
    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/me/messages", self.base.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), body));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))
    }

    /// Every id matching `q`, newest first, across all pages.
    async fn list_ids(&self, q: &str) -> Result<Vec<String>, AdapterError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("q", q.to_string()), ("maxResults", PAGE_LIMIT.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListResponse = self.get_json(&self.messages_url(), &query).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(ids),
            }
        }
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage, AdapterError> {
        self.get_full(id)
            .await
            .map_err(|e| e.for_message(&MessageId::from_raw(id)))
    }

    async fn get_full(&self, id: &str) -> Result<MailMessage, AdapterError> {
        let url = format!("{}/{id}", self.messages_url());
        let raw: GmailMessage = self
            .get_json(&url, &[("format", "full".to_string())])
            .await?;
        MailMessage::try_from(raw)
    }

    /// The `max` oldest messages past `cursor`, returned newest first.
    /// Walks `ids` (newest first) from the old end.
    async fn oldest_batch(
        self,
        ids: Vec<String>,
        cursor: Cursor,
        max: usize,
    ) -> Vec<Result<MailMessage, AdapterError>> {
        let mut batch = Vec::with_capacity(max);
        let mut admitted = 0;
        for id in ids.iter().rev() {
            if admitted == max {
                break;
            }
            match self.get_message(id).await {
                Ok(msg) if !cursor.admits(msg.internal_date) => {}
                Ok(msg) => {
                    admitted += 1;
                    batch.push(Ok(msg));
                }
                Err(e @ AdapterError::Unreadable { .. }) => batch.push(Err(e)),
                Err(e) => return vec![Err(e)],
            }
        }
        batch.reverse();
        batch
    }
}

/// [`MailSource`] over the Gmail REST API. Ids are listed up front
/// (newest first, as Gmail returns them); full messages are fetched one at
/// a time as the stream is polled. When more than `max_messages` are
/// unseen, the oldest batch is fetched first and later cycles work forward.
pub struct GmailSource {
    config: GmailConfig,
    http: reqwest::Client,
    auth: Arc<GoogleAuth>,
}

impl GmailSource {
    pub fn new(config: GmailConfig, http: reqwest::Client, auth: Arc<GoogleAuth>) -> Self {
        Self { config, http, auth }
    }
}

#[async_trait]
impl MailSource for GmailSource {
    fn name(&self) -> &str {
        "gmail"
    }

    #[instrument(skip(self))]
    async fn fetch_since(&self, cursor: Cursor) -> Result<MessageStream, AdapterError> {
        let api = Api {
            http: self.http.clone(),
            base: self.config.api_base.clone(),
            token: self.auth.access_token().await?,
        };
        let q = self.config.query_for(cursor);
        let ids = api.list_ids(&q).await?;
        let max = self.config.max_messages;
        debug!(query = %q, listed = ids.len(), "gmail ids listed");

        if ids.len() > max {
            info!(listed = ids.len(), max, "backlog exceeds batch size, taking oldest first");
            let stream = futures::stream::once(api.oldest_batch(ids, cursor, max))
                .flat_map(futures::stream::iter);
            return Ok(Box::pin(stream));
        }

        let stream = futures::stream::iter(ids)
            .then(move |id| {
                let api = api.clone();
                async move { api.get_message(&id).await }
            })
            .try_filter(move |msg| futures::future::ready(cursor.admits(msg.internal_date)));
        Ok(Box::pin(stream))
    }
}
