//! SQLite database wrapper
//!
//! One connection behind a mutex. All reads go through [`SqliteDatabase::read`]
//! (deferred transaction, consistent snapshot) and all writes through
//! [`SqliteDatabase::write`] (immediate transaction, commit on `Ok`).

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Default time a writer waits on a lock held by another process
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// SQLite database shared by every store component
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteDatabase {
    /// Open or create a SQLite database file
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure(&conn, busy_timeout_ms, true)?;

        tracing::debug!(path = %path.display(), "opened prompt database");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory database for testing
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn, DEFAULT_BUSY_TIMEOUT_MS, false)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn configure(conn: &Connection, busy_timeout_ms: u64, wal: bool) -> Result<()> {
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if wal {
            // journal_mode returns the resulting mode as a row
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "configured journal mode");
        }

        Ok(())
    }

    /// Run `f` against a read snapshot
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.finish()?;
        Ok(value)
    }

    /// Run `f` inside a write transaction, committing only if it succeeds
    ///
    /// Any error rolls the whole transaction back, so callers never observe
    /// a partially applied mutation.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a write transaction that is always rolled back
    ///
    /// Dry runs execute the same statements as the real operation and report
    /// what they did, leaving the store untouched.
    pub fn rehearse<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.rollback()?;
        Ok(value)
    }

    /// Path of the backing file (`None` for in-memory databases)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_database_creation() -> Result<()> {
        let db = SqliteDatabase::open_in_memory()?;
        assert!(db.path().is_none());
        Ok(())
    }

    #[test]
    fn test_write_commits_and_read_sees_it() -> Result<()> {
        let db = SqliteDatabase::open_in_memory()?;

        db.write(|tx| {
            tx.execute("CREATE TABLE test (id INTEGER, name TEXT)", [])?;
            tx.execute("INSERT INTO test VALUES (?1, ?2)", rusqlite::params![1, "test"])?;
            Ok(())
        })?;

        let name: String = db.read(|conn| {
            Ok(conn.query_row("SELECT name FROM test WHERE id = ?1", [1], |row| {
                row.get(0)
            })?)
        })?;
        assert_eq!(name, "test");

        Ok(())
    }

    #[test]
    fn test_failed_write_rolls_back() -> Result<()> {
        let db = SqliteDatabase::open_in_memory()?;
        db.write(|tx| {
            tx.execute("CREATE TABLE test (id INTEGER)", [])?;
            Ok(())
        })?;

        let result: Result<()> = db.write(|tx| {
            tx.execute("INSERT INTO test VALUES (1)", [])?;
            Err(StoreError::invalid("abort"))
        });
        assert!(result.is_err());

        let count: i64 = db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 0);

        Ok(())
    }

    #[test]
    fn test_rehearse_never_commits() -> Result<()> {
        let db = SqliteDatabase::open_in_memory()?;
        db.write(|tx| {
            tx.execute("CREATE TABLE test (id INTEGER)", [])?;
            Ok(())
        })?;

        let inserted = db.rehearse(|tx| Ok(tx.execute("INSERT INTO test VALUES (1)", [])?))?;
        assert_eq!(inserted, 1);

        let count: i64 = db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 0);

        Ok(())
    }

    #[test]
    fn test_open_file_creates_parent_dirs() -> Result<()> {
        let dir = tempdir().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let path = dir.path().join("nested").join("prompts.db");

        let db = SqliteDatabase::open(&path, DEFAULT_BUSY_TIMEOUT_MS)?;
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());

        Ok(())
    }
}
