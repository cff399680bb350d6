use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    cycle_id TEXT,
    msg_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_cycle ON logs(cycle_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

/// A persisted warn+ log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub cycle_id: Option<String>,
    pub msg_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]; also the `/logs` query string.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub cycle_id: Option<String>,
    pub msg_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs so failed poll cycles can be
/// inspected after the fact.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        // The file may be shared with the inbox store, which holds write
        // transactions of its own.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failed log write must never take the caller down.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, cycle_id, msg_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.cycle_id,
                record.msg_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, cycle_id, msg_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(cycle_id) = &q.cycle_id {
            sql.push_str(&format!(" AND cycle_id = ?{}", params.len() + 1));
            params.push(Box::new(cycle_id.clone()));
        }
        if let Some(msg_id) = &q.msg_id {
            sql.push_str(&format!(" AND msg_id = ?{}", params.len() + 1));
            params.push(Box::new(msg_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                cycle_id: row.get(6)?,
                msg_id: row.get(7)?,
            })
        })?;

        rows.collect()
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    cycle_id: Option<String>,
    msg_id: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    cycle_id: Option<String>,
    msg_id: Option<String>,
}

impl FieldVisitor {
    fn put_str(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "cycle_id" => self.cycle_id = Some(value),
            "msg_id" => self.msg_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = match field.name() {
            "cycle_id" | "msg_id" => val.trim_matches('"').to_string(),
            _ => val,
        };
        self.put_str(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit the poll cycle / message ids.
struct SpanFields {
    cycle_id: Option<String>,
    msg_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.cycle_id.is_none() || visitor.msg_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.cycle_id.is_none() {
                            visitor.cycle_id.clone_from(&fields.cycle_id);
                        }
                        if visitor.msg_id.is_none() {
                            visitor.msg_id.clone_from(&fields.msg_id);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            cycle_id: visitor.cycle_id,
            msg_id: visitor.msg_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.cycle_id.is_some() || visitor.msg_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    cycle_id: visitor.cycle_id,
                    msg_id: visitor.msg_id,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, target: &str, msg: &str, cycle: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: target.into(),
            message: msg.into(),
            fields: None,
            cycle_id: cycle.map(str::to_string),
            msg_id: None,
        });
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        insert(&sink, "2026-10-01T12:00:00Z", "WARN", "inbox_engine", "slow", None);
        assert_eq!(sink.query(&LogQuery::default()).unwrap().len(), 1);
        assert!(path.exists());
    }

    #[test]
    fn insert_waits_out_a_concurrent_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.db");
        let sink = SqliteLogSink::new(&path).unwrap();

        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            writer.execute_batch("COMMIT").unwrap();
        });

        insert(&sink, "2026-10-01T12:00:00Z", "ERROR", "inbox_store", "while locked", None);
        release.join().unwrap();
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "while locked");
    }

    #[test]
    fn query_filters() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "2026-10-01T11:00:00Z", "WARN", "inbox_gmail::source", "old", Some("poll_a"));
        insert(&sink, "2026-10-01T13:00:00Z", "ERROR", "inbox_llm::gemini", "boom", Some("poll_b"));

        let by_level = sink
            .query(&LogQuery { level: Some("error".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_level.len(), 1);
        assert_eq!(by_level[0].message, "boom");

        let by_target = sink
            .query(&LogQuery { target: Some("gmail".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_target[0].message, "old");

        let by_cycle = sink
            .query(&LogQuery { cycle_id: Some("poll_b".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_cycle.len(), 1);

        let since = sink
            .query(&LogQuery { since: Some("2026-10-01T12:00:00Z".into()), ..Default::default() })
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].message, "boom");
    }

    #[test]
    fn query_limit_newest_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            insert(&sink, &format!("2026-10-01T12:00:{i:02}Z"), "WARN", "t", &format!("msg {i}"), None);
        }
        let results = sink
            .query(&LogQuery { limit: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_warn_and_inherits_span_ids() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not persisted");
            let span = tracing::info_span!("poll_cycle", cycle_id = "poll_123");
            let _enter = span.enter();
            tracing::warn!(msg_id = "m1", attempts = 2u64, "classification failed");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.level, "WARN");
        assert_eq!(row.message, "classification failed");
        assert_eq!(row.cycle_id.as_deref(), Some("poll_123"));
        assert_eq!(row.msg_id.as_deref(), Some("m1"));
        assert!(row.fields.as_deref().unwrap_or_default().contains("attempts"));
    }
}
