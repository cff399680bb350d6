//! System instructions and prompt builders for the three model modes:
//! classification, assistant guidance and free-text Q&A.

use regex::Regex;

const CLASSIFIER_INSTRUCTION: &str = "You are an email triage classifier for a busy professional. \
Analyze each email and return structured JSON describing its importance and whether the sender expects the user to respond. \
The JSON must contain the keys importance (boolean), importance_score (float 0-1), reply_needed (boolean), reply_needed_score (float 0-1), and rationale (string). \
Importance captures urgency or business impact that warrants quick attention. \
Reply_needed is true only when the sender clearly awaits a personal response from the user, for example direct questions, requests for confirmation, scheduling coordination, or deliverables. \
Treat newsletters, promotions, marketing blasts, receipts, and automated notifications as reply_needed=false unless they explicitly demand that the user reply. \
Base your judgement on the sender's intent and context rather than isolated keywords, and explain any uncertainty in the rationale.";

pub const QA_INSTRUCTION: &str = "You are a helpful inbox analyst. Answer questions using only the provided email context. \
If the context does not contain the answer, say that you are not sure.";

pub const ASSISTANT_INSTRUCTION: &str = "You are Inbox Buddy, a proactive personal email assistant. \
When an email almost certainly needs a personal reply, craft a concise notification for the user, highlight the key points they should address, and draft a short, friendly reply they can send. \
Always reply in JSON with the keys notification (string under 200 characters addressing the user as 'you'), summary (array of up to three short bullet strings), and reply_draft (string containing a brief email reply written in first person as the user).";

/// Names the inbox owner answers to, compiled for mention detection.
#[derive(Clone, Debug, Default)]
pub struct OwnerContext {
    display_names: Vec<String>,
    phrase_patterns: Vec<Regex>,
    token_patterns: Vec<Regex>,
}

impl OwnerContext {
    pub fn new(name: Option<&str>, aliases: &[String]) -> Self {
        let display_names: Vec<String> = name
            .into_iter()
            .chain(aliases.iter().map(String::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut phrase_patterns = Vec::new();
        let mut tokens: Vec<String> = Vec::new();
        for entry in &display_names {
            let lowered = entry.to_lowercase();
            let parts: Vec<&str> = lowered
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '@'))
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() > 1 {
                let joined = parts.iter().map(|p| regex::escape(p)).collect::<Vec<_>>().join(r"\s+");
                if let Ok(re) = Regex::new(&format!(r"\b{joined}\b")) {
                    phrase_patterns.push(re);
                }
            }
            if parts.is_empty() {
                tokens.push(lowered.clone());
            } else {
                tokens.extend(parts.iter().map(|p| p.to_string()));
            }
        }
        tokens.sort();
        tokens.dedup();
        let token_patterns = tokens
            .iter()
            .filter_map(|t| Regex::new(&format!(r"\b{}\b", regex::escape(t))).ok())
            .collect();

        Self {
            display_names,
            phrase_patterns,
            token_patterns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_names.is_empty()
    }

    /// Whether `text` addresses the owner by any configured name.
    pub fn is_mentioned(&self, text: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        self.phrase_patterns
            .iter()
            .chain(self.token_patterns.iter())
            .any(|re| re.is_match(&lowered))
    }

    fn instruction(&self) -> String {
        match self.display_names.as_slice() {
            [] => String::new(),
            [one] => format!(
                " Prioritize situations where the sender directly addresses {one} by name as evidence that they expect a response."
            ),
            many => format!(
                " Treat direct references to these names as strong signals a personal reply is required: {}.",
                many.join(", ")
            ),
        }
    }

    fn prompt_hint(&self) -> Option<String> {
        match self.display_names.as_slice() {
            [] => None,
            [one] => Some(format!(
                "The inbox owner goes by {one}. Treat direct mentions of this name as a strong signal that the sender wants their personal reply."
            )),
            many => Some(format!(
                "The inbox owner responds to the following names: {}. Treat mentions of any of them as a strong signal the sender expects their personal reply.",
                many.join(", ")
            )),
        }
    }
}

pub fn classifier_instruction(owner: &OwnerContext) -> String {
    format!("{CLASSIFIER_INSTRUCTION}{}", owner.instruction())
}

pub fn classify_prompt(email_text: &str, owner: &OwnerContext) -> String {
    let body = format!(
        "Classify the following email. Provide the JSON object requested in the system instructions.\n\
         Email content is enclosed between triple backticks.\n```\n{}\n```",
        email_text.trim()
    );
    match owner.prompt_hint() {
        Some(hint) => format!("{hint}\n\n{body}"),
        None => body,
    }
}

pub fn assistant_prompt(sender: &str, subject: &str, body: &str) -> String {
    let email_text = format!("From: {sender}\nSubject: {subject}\n\n{body}");
    format!(
        "A new email probably needs a personal reply. \
         Summarize it for the user and draft a short reply they can send. \
         Respond with JSON matching the schema described in the system instruction.\n\
         Email content is between triple backticks.\n```\n{}\n```",
        email_text.trim()
    )
}

pub fn qa_prompt(question: &str, context: &str) -> String {
    format!(
        "Context between triple quotes should be used to answer the user's question. \
         If the answer is not present, reply that you are not sure.\n\n\
         Context:\n\"\"\"\n{context}\n\"\"\"\n\nQuestion: {question}"
    )
}
