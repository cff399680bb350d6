use async_trait::async_trait;

use crate::email::{MailMessage, Triage};
use crate::errors::ClassificationError;

/// Language-model boundary used by the poll loop and the ask service.
#[async_trait]
pub trait TriageClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Score one message. Scores must already be validated to [0, 1].
    async fn classify(&self, message: &MailMessage) -> Result<Triage, ClassificationError>;

    /// Answer `question` from the serialized email `context`, verbatim.
    async fn answer_free_text(
        &self,
        question: &str,
        context: &str,
    ) -> Result<String, ClassificationError>;
}
