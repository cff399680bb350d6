use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the inbox database.
///
/// Every store operation takes the connection mutex for one short
/// synchronous section; writes additionally run in a transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating parent directories and schema as needed) a file-backed
    /// database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("{}: {e}", dir.display())))?;
        }
        let db = Self::prepare(Connection::open(path)?)?;
        info!(path = %path.display(), "inbox database ready");
        Ok(db)
    }

    /// Private in-memory database, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read (or single-statement write) with the connection held.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    /// Run `f` in a transaction, committing only when it returns `Ok`.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > schema::SCHEMA_VERSION {
        return Err(StoreError::Database(format!(
            "database schema v{found} is newer than supported v{}",
            schema::SCHEMA_VERSION
        )));
    }
    conn.execute_batch(schema::CREATE_TABLES)?;
    if found < schema::SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
        debug!(from = found, to = schema::SCHEMA_VERSION, "schema migrated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_version(db: &Database) -> u32 {
        db.with_conn(|c| Ok(c.pragma_query_value(None, "user_version", |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn fresh_database_has_tables_and_state_row() {
        let db = Database::in_memory().unwrap();
        assert_eq!(user_version(&db), schema::SCHEMA_VERSION);

        let (cursor, generation): (i64, i64) = db
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT cursor, generation FROM poll_state WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!((cursor, generation), (0, 0));
    }

    #[test]
    fn reopen_keeps_data_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/inbox.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|c| {
                c.execute("UPDATE poll_state SET cursor = 42 WHERE id = 1", [])?;
                Ok(())
            })
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let cursor: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT cursor FROM poll_state", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(cursor, 42);
        assert_eq!(user_version(&db), schema::SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION + 1).unwrap();
        }
        let err = Database::open(&path).err().unwrap();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn failed_tx_rolls_back() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), StoreError> = db.with_tx(|tx| {
            tx.execute("UPDATE poll_state SET cursor = 99 WHERE id = 1", [])?;
            Err(StoreError::InvalidRecord("abort".into()))
        });
        assert!(result.is_err());

        let cursor: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT cursor FROM poll_state", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(cursor, 0);
    }
}
