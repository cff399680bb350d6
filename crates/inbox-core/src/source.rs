use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cursor::Cursor;
use crate::email::MailMessage;
use crate::errors::AdapterError;

/// Lazy, newest-first sequence of unseen messages. An `Unreadable` item
/// stands for one message and the stream continues after it; any other
/// error ends the stream.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<MailMessage, AdapterError>> + Send>>;

/// Read-only view of a mailbox.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn name(&self) -> &str;

    /// Messages with `internal_date` strictly after `cursor`. Pagination is
    /// the implementation's concern; callers just drain the stream.
    ///
    /// A source that bounds how many messages one fetch returns must yield
    /// the oldest unseen ones, so that advancing the cursor to the newest
    /// message yielded never skips anything.
    async fn fetch_since(&self, cursor: Cursor) -> Result<MessageStream, AdapterError>;
}

/// Credential acquisition for the mail provider.
#[async_trait]
pub trait MailAuthorizer: Send + Sync {
    async fn is_authenticated(&self) -> bool;

    /// Begin an interactive authorization, returning the URL to visit.
    async fn authorization_url(&self) -> Result<String, AdapterError>;

    /// Finish authorization with the callback `state` and `code`.
    async fn complete(&self, state: &str, code: &str) -> Result<(), AdapterError>;
}
