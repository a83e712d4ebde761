//! Database layer
//!
//! Simple SQLite wrapper plus the versioned schema every store component
//! shares. All tables live in one file.
//!
//! # Example
//! ```no_run
//! use alembic::db::{schema, SqliteDatabase};
//!
//! let db = SqliteDatabase::open("prompts.db", 5000)?;
//! schema::ensure_schema(&db)?;
//! # Ok::<(), alembic::StoreError>(())
//! ```

pub mod schema;
pub mod sqlite;

pub use sqlite::{SqliteDatabase, DEFAULT_BUSY_TIMEOUT_MS};
