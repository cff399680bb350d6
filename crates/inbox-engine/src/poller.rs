//! The poll loop: one long-lived task that pulls unseen mail, triages it,
//! stores the result and announces newly actionable messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use inbox_core::ids::CycleId;
use inbox_core::{
    AdapterError, ClassificationError, Cursor, EmailRecord, MailMessage, MailSource, PushEvent,
    TriageClassifier,
};
use inbox_store::EmailRepo;

use crate::broadcast::EventBroadcaster;

#[derive(Clone, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    /// Delay before the first cycle after startup.
    pub initial_delay: Duration,
    pub classify_timeout: Duration,
    /// Window in which repeated `auth_required` events are not re-sent.
    pub auth_suppression: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            initial_delay: Duration::from_secs(3),
            classify_timeout: Duration::from_secs(45),
            auth_suppression: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTrigger {
    Startup,
    Interval,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// No credentials; nothing fetched.
    AuthRequired,
    /// The fetch could not start.
    FetchFailed,
    /// The message stream failed part way (transport or auth); the cursor
    /// was not advanced.
    Interrupted,
    /// A reset happened during the cycle; its writes were refused.
    Stale,
    StoreFailed,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub trigger: PollTrigger,
    pub outcome: CycleOutcome,
    pub fetched: usize,
    pub classified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: usize,
    pub cursor: Cursor,
}

impl CycleReport {
    fn new(trigger: PollTrigger, cursor: Cursor) -> Self {
        Self {
            cycle_id: CycleId::new(),
            trigger,
            outcome: CycleOutcome::Completed,
            fetched: 0,
            classified: 0,
            skipped: 0,
            failed: 0,
            notified: 0,
            cursor,
        }
    }
}

/// Requests an immediate cycle from a running [`PollLoop`].
#[derive(Clone)]
pub struct PollHandle {
    tx: mpsc::Sender<()>,
}

impl PollHandle {
    /// Ask for a cycle now. Requests made while one is already queued
    /// coalesce. Returns `false` once the loop has shut down.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Cursor bookkeeping for one cycle.
struct CycleCursor {
    newest_seen: Option<i64>,
    oldest_failed: Option<i64>,
}

impl CycleCursor {
    fn seen(&mut self, internal_date: i64) {
        self.newest_seen = Some(self.newest_seen.map_or(internal_date, |n| n.max(internal_date)));
    }

    fn failed(&mut self, internal_date: i64) {
        self.oldest_failed = Some(self.oldest_failed.map_or(internal_date, |o| o.min(internal_date)));
    }

    /// Newest date seen, held back to just before the oldest failure.
    fn target(&self) -> Option<i64> {
        let newest = self.newest_seen?;
        Some(match self.oldest_failed {
            Some(failed) => newest.min(failed - 1),
            None => newest,
        })
    }
}

enum Step {
    Continue,
    Stale,
}

pub struct PollLoop {
    repo: EmailRepo,
    source: Arc<dyn MailSource>,
    classifier: Arc<dyn TriageClassifier>,
    broadcaster: EventBroadcaster,
    config: PollConfig,
    cursor: Cursor,
    /// Store generation the cursor was seeded under.
    generation: Option<u64>,
    last_auth_event: Option<Instant>,
    trigger_rx: mpsc::Receiver<()>,
}

impl PollLoop {
    pub fn new(
        repo: EmailRepo,
        source: Arc<dyn MailSource>,
        classifier: Arc<dyn TriageClassifier>,
        broadcaster: EventBroadcaster,
        config: PollConfig,
    ) -> (Self, PollHandle) {
        let (tx, trigger_rx) = mpsc::channel(1);
        let poll_loop = Self {
            repo,
            source,
            classifier,
            broadcaster,
            config,
            cursor: Cursor::EPOCH,
            generation: None,
            last_auth_event: None,
            trigger_rx,
        };
        (poll_loop, PollHandle { tx })
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Run until `cancel` fires. A cycle in flight when it does is dropped;
    /// every store write it already made is complete on its own.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            source = self.source.name(),
            classifier = self.classifier.name(),
            model = self.classifier.model(),
            interval_secs = self.config.interval.as_secs(),
            "poll loop started"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut trigger = PollTrigger::Startup;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.run_cycle(trigger) => {}
            }
            trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => PollTrigger::Interval,
                Some(()) = self.trigger_rx.recv() => PollTrigger::Manual,
            };
        }
        info!("poll loop stopped");
    }

    /// Run one cycle now.
    pub async fn run_cycle(&mut self, trigger: PollTrigger) -> CycleReport {
        let mut report = CycleReport::new(trigger, self.cursor);
        self.cycle(&mut report).await;
        report.cursor = self.cursor;

        if report.outcome != CycleOutcome::Completed {
            warn!(
                cycle_id = %report.cycle_id,
                trigger = ?report.trigger,
                outcome = ?report.outcome,
                fetched = report.fetched,
                failed = report.failed,
                cursor = %report.cursor,
                "poll cycle incomplete"
            );
        } else {
            info!(
                cycle_id = %report.cycle_id,
                trigger = ?report.trigger,
                fetched = report.fetched,
                classified = report.classified,
                skipped = report.skipped,
                failed = report.failed,
                notified = report.notified,
                cursor = %report.cursor,
                "poll cycle finished"
            );
        }
        report
    }

    #[instrument(skip_all, fields(cycle_id = %report.cycle_id, trigger = ?report.trigger))]
    async fn cycle(&mut self, report: &mut CycleReport) {
        let generation = match self.repo.generation() {
            Ok(g) => g,
            Err(e) => {
                error!(error = %e, "could not read store generation");
                report.outcome = CycleOutcome::StoreFailed;
                return;
            }
        };
        if self.generation != Some(generation) {
            match self.repo.load_cursor() {
                Ok(c) => {
                    debug!(generation, cursor = %c, "cursor seeded from store");
                    self.cursor = c;
                    self.generation = Some(generation);
                }
                Err(e) => {
                    error!(error = %e, "could not load cursor");
                    report.outcome = CycleOutcome::StoreFailed;
                    return;
                }
            }
        }

        let mut stream = match self.source.fetch_since(self.cursor).await {
            Ok(s) => s,
            Err(AdapterError::AuthRequired) => {
                self.notify_auth_required();
                report.outcome = CycleOutcome::AuthRequired;
                return;
            }
            Err(e) => {
                error!(error = %e, "mail fetch failed");
                let _ = self.broadcaster.publish(PushEvent::error(format!("mail fetch failed: {e}")));
                report.outcome = CycleOutcome::FetchFailed;
                return;
            }
        };
        self.last_auth_event = None;

        let mut bookkeeping = CycleCursor {
            newest_seen: None,
            oldest_failed: None,
        };

        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(m) => m,
                Err(AdapterError::Unreadable { id, reason }) => {
                    // No date to hold the cursor at; the message is passed over.
                    warn!(msg_id = %id, reason = %reason, "unreadable message skipped");
                    report.failed += 1;
                    let _ = self
                        .broadcaster
                        .publish(PushEvent::error(format!("message {id} unreadable: {reason}")));
                    continue;
                }
                Err(e) => {
                    if e.is_auth() {
                        self.notify_auth_required();
                    } else {
                        error!(error = %e, "mail stream failed mid-cycle");
                        let _ = self
                            .broadcaster
                            .publish(PushEvent::error(format!("mail fetch failed: {e}")));
                    }
                    report.outcome = CycleOutcome::Interrupted;
                    return;
                }
            };
            report.fetched += 1;
            bookkeeping.seen(msg.internal_date);

            match self.process(&msg, generation, report, &mut bookkeeping).await {
                Step::Continue => {}
                Step::Stale => {
                    info!(msg_id = %msg.id, "store was reset during cycle, abandoning it");
                    report.outcome = CycleOutcome::Stale;
                    return;
                }
            }
        }

        let Some(target) = bookkeeping.target() else {
            return;
        };
        if target <= self.cursor.millis() {
            return;
        }
        match self.repo.advance_cursor(Cursor::from_millis(target), generation) {
            Ok(c) => {
                debug!(from = %self.cursor, to = %c, "cursor advanced");
                self.cursor = c;
            }
            Err(e) if e.is_stale() => report.outcome = CycleOutcome::Stale,
            Err(e) => {
                error!(error = %e, "cursor advance failed");
                report.outcome = CycleOutcome::StoreFailed;
            }
        }
    }

    /// Triage and store one message.
    async fn process(
        &mut self,
        msg: &MailMessage,
        generation: u64,
        report: &mut CycleReport,
        bookkeeping: &mut CycleCursor,
    ) -> Step {
        if msg.is_promotional() {
            debug!(msg_id = %msg.id, "promotional message skipped");
            report.skipped += 1;
            return Step::Continue;
        }

        match self.repo.is_classified(&msg.id) {
            Ok(true) => {
                report.skipped += 1;
                // Unread state still follows the provider.
                return match self.repo.upsert_at(&EmailRecord::pending(msg), generation) {
                    Err(e) if e.is_stale() => Step::Stale,
                    Err(e) => {
                        warn!(msg_id = %msg.id, error = %e, "unread state update failed");
                        Step::Continue
                    }
                    Ok(_) => Step::Continue,
                };
            }
            Ok(false) => {}
            Err(e) => {
                error!(msg_id = %msg.id, error = %e, "dedup lookup failed");
                report.failed += 1;
                bookkeeping.failed(msg.internal_date);
                return Step::Continue;
            }
        }

        let triage = match tokio::time::timeout(self.config.classify_timeout, self.classifier.classify(msg)).await {
            Ok(result) => result,
            Err(_) => Err(ClassificationError::Timeout(self.config.classify_timeout)),
        };

        let triage = match triage {
            Ok(t) => t,
            Err(e) => {
                warn!(msg_id = %msg.id, kind = e.kind(), error = %e, "classification failed");
                report.failed += 1;
                bookkeeping.failed(msg.internal_date);
                let _ = self
                    .broadcaster
                    .publish(PushEvent::error(format!("classification failed for {}: {e}", msg.id)));
                return match self.repo.upsert_at(&EmailRecord::pending(msg), generation) {
                    Err(e) if e.is_stale() => Step::Stale,
                    Err(e) => {
                        error!(msg_id = %msg.id, error = %e, "pending upsert failed");
                        Step::Continue
                    }
                    Ok(_) => Step::Continue,
                };
            }
        };

        let mut record = EmailRecord::classified(msg, triage, Utc::now());
        match self.repo.upsert_at(&record, generation) {
            Ok(outcome) => {
                report.classified += 1;
                if outcome.newly_actionable {
                    record.is_actionable = true;
                    let _ = self.broadcaster.publish(PushEvent::important(record));
                    report.notified += 1;
                }
                Step::Continue
            }
            Err(e) if e.is_stale() => Step::Stale,
            Err(e) => {
                error!(msg_id = %msg.id, error = %e, "classified upsert failed");
                report.failed += 1;
                bookkeeping.failed(msg.internal_date);
                Step::Continue
            }
        }
    }

    fn notify_auth_required(&mut self) {
        let now = Instant::now();
        if self
            .last_auth_event
            .is_some_and(|sent| now.duration_since(sent) < self.config.auth_suppression)
        {
            debug!("auth_required suppressed");
            return;
        }
        warn!("mail provider authentication required");
        self.last_auth_event = Some(now);
        let _ = self.broadcaster.publish(PushEvent::AuthRequired);
    }
}
