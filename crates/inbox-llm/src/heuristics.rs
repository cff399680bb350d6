//! Deterministic post-processing of classifier scores.

use std::sync::LazyLock;

use regex::Regex;

use crate::parse::RawScores;
use crate::prompt::OwnerContext;

const MARKETING_CAP: f64 = 0.3;
const NO_REPLY_CAP: f64 = 0.3;
const NO_REPLY_OVERRIDE: f64 = 0.95;
const MENTION_MIN: f64 = 0.35;
const MENTION_FLOOR: f64 = 0.7;

const MARKETING_CUES: &[&str] = &[
    "unsubscribe",
    "view this email in your browser",
    "view in browser",
    "special offer",
    "limited time",
    "sale",
    "deal",
    "% off",
    "discount",
    "coupon",
    "promo code",
    "book now",
    "rent a car",
    "loyalty",
    "rewards",
    "exclusive offer",
    "upgrade now",
    "act now",
    "shop now",
    "learn more",
    "manage your preferences",
    "update your preferences",
    "manage preferences",
    "manage subscription",
    "view this message online",
    "view online",
    "privacy policy",
    "no longer wish to receive",
    "newsletter",
    "digest",
    "webinar",
    "flash sale",
    "list-unsubscribe",
];

const SENDER_CUES: &[&str] = &[
    "newsletter",
    "no-reply",
    "noreply",
    "updates",
    "offers",
    "promotions",
    "marketing",
    "sales",
    "mailer",
    "notification",
    "@info",
    "@news",
    "@email.",
    "@mail.",
    "@mailer",
    "@campaign",
    "@notify",
    "@marketing",
    "@promo",
    "@deals",
    "@updates.",
    "@messaging",
    "@communication",
];

const ROUNDUP_CUES: &[&str] = &[
    "newsletter",
    "digest",
    "roundup",
    "summary",
    "highlights",
    "top stories",
    "top picks",
    "in case you missed",
    "flash sale",
];

const NO_REPLY_TAGS: &[&str] = &["no-reply", "noreply", "do-not-reply", "donotreply"];

static PERIODIC_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(daily|weekly|monthly|weekend)\s+(digest|newsletter|roundup|summary|update)\b")
        .unwrap()
});
static PERCENT_OFF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}%\s*(off|discount|savings)\b").unwrap());

/// The fields the detectors look at.
pub struct EmailSignals<'a> {
    pub sender: &'a str,
    pub subject: &'a str,
    /// Full header-plus-body text sent to the model.
    pub text: &'a str,
}

pub fn is_roundup_subject(subject: &str) -> bool {
    let s = subject.to_lowercase();
    if s.is_empty() {
        return false;
    }
    PERIODIC_SUBJECT.is_match(&s)
        || ROUNDUP_CUES.iter().any(|cue| s.contains(cue))
        || PERCENT_OFF.is_match(&s)
}

pub fn looks_like_marketing(email: &EmailSignals<'_>) -> bool {
    let lowered = email.text.to_lowercase();
    if MARKETING_CUES.iter().any(|cue| lowered.contains(cue)) {
        return true;
    }
    if is_roundup_subject(email.subject) {
        return true;
    }
    let sender = email.sender.to_lowercase();
    SENDER_CUES.iter().any(|cue| sender.contains(cue))
}

pub fn is_no_reply_sender(email: &EmailSignals<'_>) -> bool {
    let lowered = email.text.to_lowercase();
    NO_REPLY_TAGS.iter().any(|tag| lowered.contains(tag))
}

/// Apply the marketing, no-reply and owner-mention rules. `threshold` is
/// the reply score at which a reply counts as needed.
pub fn adjust(
    raw: RawScores,
    email: &EmailSignals<'_>,
    owner: &OwnerContext,
    threshold: f64,
) -> RawScores {
    let mut importance = raw.importance;
    let mut reply_needed = raw.reply_needed;
    let mut imp = raw.importance_score;
    let mut reply = raw.reply_needed_score;

    // A model flag lifts its score to the threshold and vice versa.
    if importance {
        imp = imp.max(threshold);
    } else if imp >= threshold {
        importance = true;
    }
    if reply_needed {
        reply = reply.max(threshold);
    } else if reply >= threshold {
        reply_needed = true;
    }

    if looks_like_marketing(email) {
        importance = false;
        reply_needed = false;
        imp = imp.min(MARKETING_CAP);
        reply = reply.min(MARKETING_CAP);
    } else {
        if reply_needed && is_no_reply_sender(email) && reply < NO_REPLY_OVERRIDE {
            reply_needed = false;
            reply = reply.min(NO_REPLY_CAP);
        }
        if reply_needed && imp < reply {
            importance = true;
            imp = reply;
        }
        if reply >= MENTION_MIN && owner.is_mentioned(email.text) {
            reply_needed = true;
            reply = reply.max(MENTION_FLOOR);
            if imp < reply {
                importance = true;
                imp = imp.max(reply * 0.9);
            }
        }
    }

    RawScores {
        importance_score: imp.clamp(0.0, 1.0),
        reply_needed_score: reply.clamp(0.0, 1.0),
        importance,
        reply_needed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(imp: f64, reply: f64) -> RawScores {
        RawScores {
            importance_score: imp,
            reply_needed_score: reply,
            importance: false,
            reply_needed: false,
        }
    }

    fn signals<'a>(sender: &'a str, subject: &'a str, text: &'a str) -> EmailSignals<'a> {
        EmailSignals { sender, subject, text }
    }

    #[test]
    fn marketing_caps_both_scores() {
        let text = "From: Shop\nSubject: Hi\n\nBig savings. Unsubscribe here.";
        let e = signals("Shop <shop@example.com>", "Hi", text);
        let out = adjust(raw(0.9, 0.9), &e, &OwnerContext::default(), 0.6);
        assert_eq!(out.importance_score, 0.3);
        assert_eq!(out.reply_needed_score, 0.3);
        assert!(!out.reply_needed);
    }

    #[test]
    fn roundup_subjects_detected() {
        assert!(is_roundup_subject("Your Weekly Digest"));
        assert!(is_roundup_subject("50% off everything"));
        assert!(!is_roundup_subject("Quarterly planning"));
        assert!(!is_roundup_subject(""));
    }

    #[test]
    fn marketing_sender_detected() {
        let e = signals("Acme <hello@acme.com>", "Hi", "From: x\n\nhello");
        assert!(!looks_like_marketing(&e));
        let e = signals("Acme <team@mail.acme.com>", "Hi", "From: x\n\nhello");
        assert!(looks_like_marketing(&e));
    }

    #[test]
    fn no_reply_caps_unless_very_confident() {
        // A no-reply sender address is itself a marketing cue, so the tag
        // only appears in the body here.
        let text = "From: Ops\n\nReply to do-not-reply@corp.example is ignored. Please confirm.";
        let e = signals("Ops <ops@corp.example>", "Confirm", text);
        let out = adjust(raw(0.2, 0.8), &e, &OwnerContext::default(), 0.6);
        assert_eq!(out.reply_needed_score, 0.3);
        assert!(!out.reply_needed);

        let out = adjust(raw(0.2, 0.97), &e, &OwnerContext::default(), 0.6);
        assert_eq!(out.reply_needed_score, 0.97);
        assert_eq!(out.importance_score, 0.97);
    }

    #[test]
    fn importance_raised_to_reply_when_reply_needed() {
        let e = signals("Ana <ana@example.com>", "Contract", "From: Ana\n\nCan you sign today?");
        let out = adjust(raw(0.2, 0.8), &e, &OwnerContext::default(), 0.6);
        assert!(out.importance);
        assert_eq!(out.importance_score, 0.8);
    }

    #[test]
    fn owner_mention_promotes_reply() {
        let owner = OwnerContext::new(Some("Jane"), &[]);
        let e = signals("Ana <ana@example.com>", "Question", "From: Ana\n\nJane, thoughts on this?");
        let out = adjust(raw(0.3, 0.4), &e, &owner, 0.6);
        assert!(out.reply_needed);
        assert_eq!(out.reply_needed_score, 0.7);
        assert!((out.importance_score - 0.63).abs() < 1e-9);

        // Below the mention minimum nothing changes.
        let out = adjust(raw(0.3, 0.2), &e, &owner, 0.6);
        assert_eq!(out.reply_needed_score, 0.2);
    }

    #[test]
    fn model_flag_lifts_score_to_threshold() {
        let e = signals("Ana <ana@example.com>", "Plan", "From: Ana\n\nplan attached");
        let mut r = raw(0.1, 0.1);
        r.reply_needed = true;
        let out = adjust(r, &e, &OwnerContext::default(), 0.6);
        assert_eq!(out.reply_needed_score, 0.6);
        assert_eq!(out.importance_score, 0.6);
    }
}
