//! Database handles
//!
//! Every database is an explicit [`Database`] value passed into the
//! components that need it; there is no process-wide singleton. Each handle
//! owns a writer/reader connection pair over the same WAL-mode file, so reads
//! are never blocked by the single writer.

mod migrations;

pub use migrations::{
    Migration, AGENT_MIGRATIONS, AGENT_SCHEMA, GRAPH_MIGRATIONS, GRAPH_SCHEMA, VECTOR_MIGRATIONS,
    VECTOR_SCHEMA,
};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{MemoryError, Result};

// ============================================================================
// READER CAPABILITY
// ============================================================================

/// One row as owned values, in column order
pub type Row = Vec<Value>;

/// Minimal read capability injected into components that only need scalar
/// lookups (the temporal engine). Depending on this trait instead of
/// [`Database`] keeps those components testable without a real file.
pub trait DatabaseReader: Send + Sync {
    /// Run a query and return the first row, if any
    fn get_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>>;
}

/// Extract the first column of a row as an integer, tolerating NULL
pub fn scalar_i64(row: &Row) -> Option<i64> {
    match row.first() {
        Some(Value::Integer(n)) => Some(*n),
        Some(Value::Real(f)) => Some(*f as i64),
        _ => None,
    }
}

// ============================================================================
// DATABASE HANDLE
// ============================================================================

/// A WAL-mode SQLite database with a single writer and a concurrent reader
///
/// All methods take `&self`; the handle is `Send + Sync` and is shared behind
/// an `Arc` by the stores built on top of it.
pub struct Database {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Apply performance PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) a database file and bring its schema up to date
    ///
    /// `schema_name` keys the stored version in `_schema_versions`; init is
    /// idempotent and skipped entirely when the stored version matches.
    pub fn open(path: impl AsRef<Path>, schema_name: &str, migrations: &[Migration]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        migrations::apply_migrations(&writer, schema_name, migrations)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
        })
    }

    /// Lock the writer connection
    pub fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| MemoryError::lock("writer"))
    }

    /// Lock the reader connection
    pub fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| MemoryError::lock("reader"))
    }

    /// Path this handle was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatabaseReader for Database {
    fn get_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().cloned()))?;
        match rows.next()? {
            Some(row) => {
                let mut out = Vec::with_capacity(columns);
                for i in 0..columns {
                    out.push(row.get::<_, Value>(i)?);
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_agent_db(dir: &TempDir) -> Database {
        Database::open(dir.path().join("agent.db"), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap()
    }

    #[test]
    fn test_open_applies_schema() {
        let dir = TempDir::new().unwrap();
        let db = open_agent_db(&dir);

        // sessions table exists and is empty
        let row = db
            .get_one("SELECT COUNT(*) FROM sessions", &[])
            .unwrap()
            .unwrap();
        assert_eq!(scalar_i64(&row), Some(0));
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_agent_db(&dir);
            db.writer()
                .unwrap()
                .execute(
                    "INSERT INTO sessions (id, project, title, created_at, updated_at, turn_count, file_path, tags)
                     VALUES ('s1', '/p', 't', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z', 0, 'x.md', '[]')",
                    [],
                )
                .unwrap();
        }
        // Second open must not wipe or re-run the schema
        let db = open_agent_db(&dir);
        let row = db
            .get_one("SELECT COUNT(*) FROM sessions", &[])
            .unwrap()
            .unwrap();
        assert_eq!(scalar_i64(&row), Some(1));
    }

    #[test]
    fn test_get_one_returns_none_for_no_rows() {
        let dir = TempDir::new().unwrap();
        let db = open_agent_db(&dir);
        let row = db
            .get_one(
                "SELECT id FROM sessions WHERE id = ?1",
                &[Value::Text("missing".into())],
            )
            .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_all_three_schemas_open() {
        let dir = TempDir::new().unwrap();
        Database::open(dir.path().join("graph.db"), GRAPH_SCHEMA, GRAPH_MIGRATIONS).unwrap();
        Database::open(
            dir.path().join("vectors.db"),
            VECTOR_SCHEMA,
            VECTOR_MIGRATIONS,
        )
        .unwrap();
    }
}
