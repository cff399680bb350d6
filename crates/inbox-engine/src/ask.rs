use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, instrument};

use inbox_core::email::truncate_chars;
use inbox_core::{ClassificationError, EmailRecord, TriageClassifier};
use inbox_store::{EmailRepo, StoreError};

pub const DEFAULT_CONTEXT_LIMIT: usize = 100;
const BODY_CONTEXT_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Classifier(#[from] ClassificationError),
}

/// Answers free-text questions about recent mail using the classifier's
/// question-answering mode.
#[derive(Clone)]
pub struct AskService {
    repo: EmailRepo,
    classifier: Arc<dyn TriageClassifier>,
    default_limit: usize,
}

impl AskService {
    pub fn new(repo: EmailRepo, classifier: Arc<dyn TriageClassifier>) -> Self {
        Self {
            repo,
            classifier,
            default_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Context size used when a request names no limit.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    #[instrument(skip_all)]
    pub async fn ask(&self, question: &str, limit: Option<usize>) -> Result<String, AskError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AskError::EmptyQuestion);
        }
        let limit = limit.unwrap_or(self.default_limit);

        let records = self.repo.list(limit, false)?;
        let context = render_context(&records);
        let answer = self.classifier.answer_free_text(question, &context).await?;
        info!(limit, context_emails = records.len(), answer_chars = answer.len(), "question answered");
        Ok(answer)
    }
}

fn render_context(records: &[EmailRecord]) -> String {
    let mut out = String::new();
    for r in records {
        let _ = write!(
            out,
            "From: {}\nSubject: {}\nBody: {}\n---\n",
            r.sender,
            r.subject,
            truncate_chars(&r.body, BODY_CONTEXT_CHARS)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_core::ids::MessageId;
    use inbox_core::MailMessage;
    use inbox_llm::MockClassifier;
    use inbox_store::Database;

    fn seed(repo: &EmailRepo, id: &str, date: i64, body: &str) {
        let msg = MailMessage {
            id: MessageId::from_raw(id),
            thread_id: None,
            sender: format!("{id}@example.com"),
            subject: format!("subject {id}"),
            snippet: String::new(),
            body: body.to_string(),
            internal_date: date,
            is_unread: true,
            labels: vec![],
        };
        repo.upsert(&EmailRecord::pending(&msg)).unwrap();
    }

    fn service(classifier: MockClassifier) -> (AskService, EmailRepo, Arc<MockClassifier>) {
        let repo = EmailRepo::new(Database::in_memory().unwrap(), 0.6);
        let classifier = Arc::new(classifier);
        (AskService::new(repo.clone(), classifier.clone()), repo, classifier)
    }

    #[tokio::test]
    async fn answers_with_recent_context() {
        let (svc, repo, mock) =
            service(MockClassifier::default().with_answer(Ok("Two invoices.".into())));
        seed(&repo, "old", 1000, "first body");
        seed(&repo, "new", 2000, "second body");

        let answer = svc.ask("  any invoices?  ", Some(1)).await.unwrap();
        assert_eq!(answer, "Two invoices.");

        let asked = mock.questions();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].0, "any invoices?");
        assert_eq!(
            asked[0].1,
            "From: new@example.com\nSubject: subject new\nBody: second body\n---\n"
        );
    }

    #[tokio::test]
    async fn long_bodies_are_cut() {
        let (svc, repo, mock) = service(MockClassifier::default().with_answer(Ok("ok".into())));
        seed(&repo, "big", 1000, &"é".repeat(5000));

        svc.ask("summary?", None).await.unwrap();
        let context = &mock.questions()[0].1;
        let body = context
            .strip_prefix("From: big@example.com\nSubject: subject big\nBody: ")
            .and_then(|rest| rest.strip_suffix("\n---\n"))
            .unwrap();
        assert_eq!(body.chars().count(), 2000);
    }

    #[tokio::test]
    async fn default_limit_applies_without_explicit_limit() {
        let (svc, repo, mock) = service(MockClassifier::default().with_answer(Ok("ok".into())));
        let svc = svc.with_default_limit(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            seed(&repo, id, 1000 + i as i64, "x");
        }
        svc.ask("which?", None).await.unwrap();
        assert_eq!(mock.questions()[0].1.matches("---\n").count(), 2);
    }

    #[tokio::test]
    async fn empty_question_is_rejected_without_a_call() {
        let (svc, _repo, mock) = service(MockClassifier::default());
        assert!(matches!(svc.ask(" \n", None).await, Err(AskError::EmptyQuestion)));
        assert_eq!(mock.answer_calls(), 0);
    }

    #[tokio::test]
    async fn classifier_failure_propagates() {
        let (svc, _repo, _mock) = service(
            MockClassifier::default()
                .with_answer(Err(ClassificationError::RateLimited { retry_after: None })),
        );
        let err = svc.ask("anything?", None).await.unwrap_err();
        assert!(matches!(
            err,
            AskError::Classifier(ClassificationError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn empty_store_gives_empty_context() {
        let (svc, _repo, mock) = service(MockClassifier::default().with_answer(Ok("nothing".into())));
        assert_eq!(svc.ask("news?", None).await.unwrap(), "nothing");
        assert_eq!(mock.questions()[0].1, "");
    }
}
