//! SQL DDL for the inbox database.

/// Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS emails (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    sender TEXT NOT NULL,
    subject TEXT NOT NULL,
    snippet TEXT NOT NULL,
    body TEXT NOT NULL,
    internal_date INTEGER NOT NULL,
    is_unread INTEGER NOT NULL,
    importance_score REAL,
    reply_needed_score REAL,
    assistant_message TEXT,
    assistant_summary TEXT,
    assistant_reply TEXT,
    classified_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(internal_date DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id);

-- Single row: poll cursor plus the reset generation.
CREATE TABLE IF NOT EXISTS poll_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    cursor INTEGER NOT NULL DEFAULT 0,
    generation INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT
);
INSERT OR IGNORE INTO poll_state (id, cursor, generation) VALUES (1, 0, 0);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
