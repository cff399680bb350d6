use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use inbox_core::ids::MessageId;
use inbox_core::{ClassificationError, MailMessage, Triage, TriageClassifier};

/// Pre-programmed classifier outcome for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Triage(Triage),
    Error(ClassificationError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Triage with the given scores and no assistant guidance.
    pub fn scores(importance: f64, reply_needed: f64) -> Self {
        Self::Triage(Triage {
            importance_score: importance,
            reply_needed_score: reply_needed,
            ..Triage::default()
        })
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Scripted classifier. Per-message scripts take precedence over the shared
/// queue; the last entry of a per-message script repeats forever.
#[derive(Default)]
pub struct MockClassifier {
    queue: Mutex<VecDeque<MockResponse>>,
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    answers: Mutex<VecDeque<Result<String, ClassificationError>>>,
    classified: Mutex<Vec<MessageId>>,
    questions: Mutex<Vec<(String, String)>>,
    classify_calls: AtomicUsize,
    answer_calls: AtomicUsize,
}

impl MockClassifier {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Script the responses for one message id, in call order.
    pub fn with_script(self, id: &str, responses: Vec<MockResponse>) -> Self {
        let _ = self.scripts.lock().insert(id.to_string(), responses.into());
        self
    }

    pub fn with_answer(self, answer: Result<String, ClassificationError>) -> Self {
        self.answers.lock().push_back(answer);
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::Relaxed)
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::Relaxed)
    }

    /// Message ids passed to `classify`, in call order.
    pub fn classified_ids(&self) -> Vec<MessageId> {
        self.classified.lock().clone()
    }

    /// `(question, context)` pairs passed to `answer_free_text`.
    pub fn questions(&self) -> Vec<(String, String)> {
        self.questions.lock().clone()
    }

    fn next_response(&self, id: &MessageId) -> Option<MockResponse> {
        {
            let mut scripts = self.scripts.lock();
            if let Some(script) = scripts.get_mut(id.as_str()) {
                return if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                };
            }
        }
        self.queue.lock().pop_front()
    }
}

async fn resolve(mut response: MockResponse) -> Result<Triage, ClassificationError> {
    loop {
        match response {
            MockResponse::Triage(triage) => return Ok(triage),
            MockResponse::Error(err) => return Err(err),
            MockResponse::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                response = *inner;
            }
        }
    }
}

#[async_trait]
impl TriageClassifier for MockClassifier {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn classify(&self, message: &MailMessage) -> Result<Triage, ClassificationError> {
        let idx = self.classify_calls.fetch_add(1, Ordering::Relaxed);
        self.classified.lock().push(message.id.clone());
        let Some(response) = self.next_response(&message.id) else {
            return Err(ClassificationError::Unavailable(format!(
                "MockClassifier: no response configured for call {idx}"
            )));
        };
        let triage = resolve(response).await?;
        triage.validate()?;
        Ok(triage)
    }

    async fn answer_free_text(
        &self,
        question: &str,
        context: &str,
    ) -> Result<String, ClassificationError> {
        let _ = self.answer_calls.fetch_add(1, Ordering::Relaxed);
        self.questions
            .lock()
            .push((question.to_string(), context.to_string()));
        self.answers.lock().pop_front().unwrap_or_else(|| {
            Err(ClassificationError::Unavailable(
                "MockClassifier: no answer configured".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> MailMessage {
        MailMessage {
            id: MessageId::from_raw(id),
            thread_id: None,
            sender: "a@example.com".into(),
            subject: "s".into(),
            snippet: String::new(),
            body: String::new(),
            internal_date: 0,
            is_unread: true,
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn queue_then_exhaustion() {
        let mock = MockClassifier::new(vec![MockResponse::scores(0.2, 0.9)]);
        let t = mock.classify(&msg("a")).await.unwrap();
        assert_eq!(t.reply_needed_score, 0.9);
        assert_eq!(mock.classify(&msg("b")).await.unwrap_err().kind(), "unavailable");
        assert_eq!(mock.classify_calls(), 2);
        assert_eq!(mock.classified_ids(), vec![MessageId::from_raw("a"), MessageId::from_raw("b")]);
    }

    #[tokio::test]
    async fn script_last_entry_repeats() {
        let mock = MockClassifier::default().with_script(
            "m3",
            vec![
                MockResponse::Error(ClassificationError::Timeout(Duration::from_secs(1))),
                MockResponse::scores(0.5, 0.5),
            ],
        );
        assert!(mock.classify(&msg("m3")).await.is_err());
        assert!(mock.classify(&msg("m3")).await.is_ok());
        assert!(mock.classify(&msg("m3")).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_scores_are_malformed() {
        let mock = MockClassifier::new(vec![MockResponse::scores(0.5, 1.7)]);
        let err = mock.classify(&msg("x")).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_before_responding() {
        let mock = MockClassifier::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::scores(0.1, 0.1),
        )]);
        let start = tokio::time::Instant::now();
        assert!(mock.classify(&msg("x")).await.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn answers_are_recorded() {
        let mock = MockClassifier::default().with_answer(Ok("42".into()));
        assert_eq!(mock.answer_free_text("q", "ctx").await.unwrap(), "42");
        assert!(mock.answer_free_text("q2", "ctx").await.is_err());
        assert_eq!(mock.answer_calls(), 2);
        assert_eq!(mock.questions()[0], ("q".to_string(), "ctx".to_string()));
    }
}
