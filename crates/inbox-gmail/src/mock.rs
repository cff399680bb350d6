use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use inbox_core::ids::MessageId;
use inbox_core::{AdapterError, Cursor, MailMessage, MailSource, MessageStream};

/// Scripted fetch outcome, consumed one per `fetch_since` call.
#[derive(Clone, Debug)]
pub enum FetchFailure {
    /// The call itself fails.
    Immediate(AdapterError),
    /// The stream yields this many messages, then the error.
    AfterItems(usize, AdapterError),
}

/// In-memory mailbox. Every fetch returns the stored messages newer than
/// the cursor, newest first. With a batch limit, only the oldest that many
/// are returned, as [`crate::GmailSource`] does with a backlog.
#[derive(Default)]
pub struct StaticSource {
    messages: Mutex<Vec<MailMessage>>,
    batch_limit: Option<usize>,
    unreadable: Mutex<HashSet<MessageId>>,
    failures: Mutex<VecDeque<FetchFailure>>,
    cursors: Mutex<Vec<Cursor>>,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(messages: Vec<MailMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    /// Every fetch yields an `Unreadable` error in place of this message.
    pub fn mark_unreadable(&self, id: &str) {
        self.unreadable.lock().insert(MessageId::from_raw(id));
    }

    pub fn push(&self, message: MailMessage) {
        self.messages.lock().push(message);
    }

    /// Queue a failure for the next fetch.
    pub fn fail_next(&self, failure: FetchFailure) {
        self.failures.lock().push_back(failure);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Cursors passed to each fetch, in call order.
    pub fn cursors(&self) -> Vec<Cursor> {
        self.cursors.lock().clone()
    }
}

#[async_trait]
impl MailSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_since(&self, cursor: Cursor) -> Result<MessageStream, AdapterError> {
        let _ = self.fetches.fetch_add(1, Ordering::Relaxed);
        self.cursors.lock().push(cursor);

        let failure = self.failures.lock().pop_front();
        if let Some(FetchFailure::Immediate(err)) = &failure {
            return Err(err.clone());
        }

        let mut unseen: Vec<MailMessage> = self
            .messages
            .lock()
            .iter()
            .filter(|m| cursor.admits(m.internal_date))
            .cloned()
            .collect();
        unseen.sort_by(|a, b| b.internal_date.cmp(&a.internal_date));
        if let Some(limit) = self.batch_limit {
            let skip = unseen.len().saturating_sub(limit);
            unseen = unseen.split_off(skip);
        }

        let unreadable = self.unreadable.lock().clone();
        let mut items: Vec<Result<MailMessage, AdapterError>> = unseen
            .into_iter()
            .map(|m| {
                if unreadable.contains(&m.id) {
                    Err(AdapterError::Unreadable {
                        id: m.id,
                        reason: "scripted".into(),
                    })
                } else {
                    Ok(m)
                }
            })
            .collect();
        if let Some(FetchFailure::AfterItems(n, err)) = failure {
            items.truncate(n);
            items.push(Err(err));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}
