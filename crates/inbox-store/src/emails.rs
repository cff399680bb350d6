use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, instrument};

use inbox_core::email::is_valid_score;
use inbox_core::ids::{MessageId, ThreadId};
use inbox_core::{Cursor, EmailRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_string_list, parse_timestamp};

const COLUMNS: &str = "id, thread_id, sender, subject, snippet, body, internal_date, is_unread, \
     importance_score, reply_needed_score, assistant_message, assistant_summary, \
     assistant_reply, classified_at";

/// What an upsert did. `newly_actionable` gates notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: bool,
    pub newly_actionable: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ListQuery {
    pub limit: usize,
    pub actionable_only: bool,
    /// Keep only the newest record of each thread.
    pub collapse_threads: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            actionable_only: true,
            collapse_threads: false,
        }
    }
}

/// Durable table of triaged emails, keyed by provider message id.
#[derive(Clone)]
pub struct EmailRepo {
    db: Database,
    threshold: f64,
}

impl EmailRepo {
    /// `threshold` is the reply-needed score at which a classified record
    /// counts as actionable.
    pub fn new(db: Database, threshold: f64) -> Self {
        Self { db, threshold }
    }


    /// Insert or update by id against the current generation.
    pub fn upsert(&self, record: &EmailRecord) -> Result<UpsertOutcome, StoreError> {
        self.upsert_inner(record, None)
    }

    /// Insert or update by id, refused with `StaleGeneration` if a reset
    /// happened since `generation` was read.
    pub fn upsert_at(
        &self,
        record: &EmailRecord,
        generation: u64,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_inner(record, Some(generation))
    }

    #[instrument(skip(self, record), fields(msg_id = %record.id))]
    fn upsert_inner(
        &self,
        record: &EmailRecord,
        generation: Option<u64>,
    ) -> Result<UpsertOutcome, StoreError> {
        validate(record)?;
        let threshold = self.threshold;

        self.db.with_tx(|tx| {
            if let Some(expected) = generation {
                check_generation(tx, expected)?;
            }

            let existing: Option<(Option<String>, Option<f64>)> = tx
                .query_row(
                    "SELECT classified_at, reply_needed_score FROM emails WHERE id = ?1",
                    [record.id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let now = Utc::now().to_rfc3339();
            let now_actionable = record.actionable_at(threshold);

            let Some((prev_classified_at, prev_reply)) = existing else {
                insert(tx, record, &now)?;
                debug!(actionable = now_actionable, "email inserted");
                return Ok(UpsertOutcome {
                    created: true,
                    newly_actionable: now_actionable,
                });
            };

            let was_classified = prev_classified_at.is_some();
            if was_classified && !record.is_classified() {
                // Pending over classified: only provider state moves.
                tx.execute(
                    "UPDATE emails SET is_unread = ?2, updated_at = ?3 WHERE id = ?1",
                    params![record.id.as_str(), record.is_unread, now],
                )?;
                return Ok(UpsertOutcome::default());
            }

            update(tx, record, &now)?;
            let was_actionable = was_classified && prev_reply.is_some_and(|s| s >= threshold);
            Ok(UpsertOutcome {
                created: false,
                newly_actionable: now_actionable && !was_actionable,
            })
        })
    }

    /// Records newest first by `internal_date`, ties broken by id.
    pub fn list(&self, limit: usize, actionable_only: bool) -> Result<Vec<EmailRecord>, StoreError> {
        self.query(ListQuery {
            limit,
            actionable_only,
            collapse_threads: false,
        })
    }

    #[instrument(skip(self))]
    pub fn query(&self, q: ListQuery) -> Result<Vec<EmailRecord>, StoreError> {
        if q.limit == 0 {
            return Ok(Vec::new());
        }
        let filter = if q.actionable_only {
            "WHERE classified_at IS NOT NULL AND reply_needed_score >= ?2"
        } else {
            ""
        };
        let sql = if q.collapse_threads {
            format!(
                "SELECT {COLUMNS} FROM (
                     SELECT *, ROW_NUMBER() OVER (
                         PARTITION BY COALESCE(thread_id, id)
                         ORDER BY internal_date DESC, id DESC
                     ) AS rn FROM emails {filter}
                 ) WHERE rn = 1
                 ORDER BY internal_date DESC, id DESC LIMIT ?1"
            )
        } else {
            format!(
                "SELECT {COLUMNS} FROM emails {filter}
                 ORDER BY internal_date DESC, id DESC LIMIT ?1"
            )
        };

        let limit = i64::try_from(q.limit).unwrap_or(i64::MAX);
        let threshold = self.threshold;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = if q.actionable_only {
                stmt.query(params![limit, threshold])?
            } else {
                stmt.query(params![limit])?
            };
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row, threshold)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(msg_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<EmailRecord, StoreError> {
        let threshold = self.threshold;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM emails WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_record(row, threshold),
                None => Err(StoreError::NotFound(format!("email {id}"))),
            }
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// Whether `id` already carries a classification.
    pub fn is_classified(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM emails WHERE id = ?1 AND classified_at IS NOT NULL",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Delete every record, rewind the cursor and bump the generation in
    /// one transaction. Returns the number of records deleted.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<u64, StoreError> {
        let deleted = self.db.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM emails", [])?;
            tx.execute(
                "UPDATE poll_state SET cursor = 0, generation = generation + 1, updated_at = ?1
                 WHERE id = 1",
                [Utc::now().to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })?;
        info!(deleted, "inbox reset");
        Ok(deleted)
    }

    pub fn load_cursor(&self) -> Result<Cursor, StoreError> {
        self.db.with_conn(|conn| {
            let millis: i64 =
                conn.query_row("SELECT cursor FROM poll_state WHERE id = 1", [], |row| row.get(0))?;
            Ok(Cursor::from_millis(millis))
        })
    }

    /// Move the persisted cursor forward (never backward). Refused if the
    /// store was reset after `generation` was read.
    #[instrument(skip(self))]
    pub fn advance_cursor(&self, cursor: Cursor, generation: u64) -> Result<Cursor, StoreError> {
        self.db.with_tx(|tx| {
            check_generation(tx, generation)?;
            tx.execute(
                "UPDATE poll_state SET cursor = MAX(cursor, ?1), updated_at = ?2 WHERE id = 1",
                params![cursor.millis(), Utc::now().to_rfc3339()],
            )?;
            let millis: i64 =
                tx.query_row("SELECT cursor FROM poll_state WHERE id = 1", [], |row| row.get(0))?;
            Ok(Cursor::from_millis(millis))
        })
    }

    pub fn generation(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| read_generation(conn))
    }
}

fn read_generation(conn: &rusqlite::Connection) -> Result<u64, StoreError> {
    let g: i64 = conn.query_row("SELECT generation FROM poll_state WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(g as u64)
}

fn check_generation(conn: &rusqlite::Connection, expected: u64) -> Result<(), StoreError> {
    let current = read_generation(conn)?;
    if current != expected {
        return Err(StoreError::StaleGeneration { expected, current });
    }
    Ok(())
}

fn validate(record: &EmailRecord) -> Result<(), StoreError> {
    for (name, score) in [
        ("importance_score", record.importance_score),
        ("reply_needed_score", record.reply_needed_score),
    ] {
        if let Some(s) = score {
            if !is_valid_score(s) {
                return Err(StoreError::InvalidRecord(format!("{name} out of range: {s}")));
            }
        }
    }
    if record.is_classified() && record.reply_needed_score.is_none() {
        return Err(StoreError::InvalidRecord(
            "classified record without reply_needed_score".into(),
        ));
    }
    Ok(())
}

fn summary_json(record: &EmailRecord) -> Result<Option<String>, StoreError> {
    record
        .assistant_summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn insert(conn: &rusqlite::Connection, r: &EmailRecord, now: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO emails (id, thread_id, sender, subject, snippet, body, internal_date,
             is_unread, importance_score, reply_needed_score, assistant_message,
             assistant_summary, assistant_reply, classified_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            r.id.as_str(),
            r.thread_id.as_ref().map(ThreadId::as_str),
            r.sender,
            r.subject,
            r.snippet,
            r.body,
            r.internal_date,
            r.is_unread,
            r.importance_score,
            r.reply_needed_score,
            r.assistant_message,
            summary_json(r)?,
            r.assistant_reply,
            r.classified_at.map(|t| t.to_rfc3339()),
            now,
        ],
    )?;
    Ok(())
}

/// Full refresh of a row. `internal_date` is never rewritten.
fn update(conn: &rusqlite::Connection, r: &EmailRecord, now: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE emails SET thread_id = ?2, sender = ?3, subject = ?4, snippet = ?5, body = ?6,
             is_unread = ?7, importance_score = ?8, reply_needed_score = ?9,
             assistant_message = ?10, assistant_summary = ?11, assistant_reply = ?12,
             classified_at = ?13, updated_at = ?14
         WHERE id = ?1",
        params![
            r.id.as_str(),
            r.thread_id.as_ref().map(ThreadId::as_str),
            r.sender,
            r.subject,
            r.snippet,
            r.body,
            r.is_unread,
            r.importance_score,
            r.reply_needed_score,
            r.assistant_message,
            summary_json(r)?,
            r.assistant_reply,
            r.classified_at.map(|t| t.to_rfc3339()),
            now,
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>, threshold: f64) -> Result<EmailRecord, StoreError> {
    const T: &str = "emails";
    let mut record = EmailRecord {
        id: MessageId::from_raw(get::<String>(row, 0, T, "id")?),
        thread_id: get::<Option<String>>(row, 1, T, "thread_id")?.map(ThreadId::from_raw),
        sender: get(row, 2, T, "sender")?,
        subject: get(row, 3, T, "subject")?,
        snippet: get(row, 4, T, "snippet")?,
        body: get(row, 5, T, "body")?,
        internal_date: get(row, 6, T, "internal_date")?,
        is_unread: get(row, 7, T, "is_unread")?,
        importance_score: get(row, 8, T, "importance_score")?,
        reply_needed_score: get(row, 9, T, "reply_needed_score")?,
        is_actionable: false,
        assistant_message: get(row, 10, T, "assistant_message")?,
        assistant_summary: parse_string_list(get(row, 11, T, "assistant_summary")?, T, "assistant_summary")?,
        assistant_reply: get(row, 12, T, "assistant_reply")?,
        classified_at: parse_timestamp(get(row, 13, T, "classified_at")?, T, "classified_at")?,
    };
    record.is_actionable = record.actionable_at(threshold);
    Ok(record)
}
