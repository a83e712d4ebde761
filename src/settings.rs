//! Persisted key/value settings
//!
//! Values are stored as strings and interpreted by the reader. A missing key
//! or a value that does not parse as the requested type yields the caller's
//! default.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::SqliteDatabase;
use crate::error::{Result, StoreError};
use crate::storage::types::to_millis;

/// Well-known keys read by the lifecycle manager
pub mod keys {
    /// Capacity ceiling for cleanup
    pub const MAX_PROMPTS: &str = "max_prompts";
    /// Relevance floor; cleanup protects records at or above the larger of
    /// this and `protect_relevance_score`
    pub const MIN_RELEVANCE_SCORE: &str = "min_relevance_score";
    /// Protection threshold for cleanup (raised to `min_relevance_score` if lower)
    pub const PROTECT_RELEVANCE_SCORE: &str = "protect_relevance_score";
    pub const RELEVANCE_HALF_LIFE_DAYS: &str = "relevance_half_life_days";
    pub const RELEVANCE_USAGE_SATURATION: &str = "relevance_usage_saturation";
    pub const RELEVANCE_RECENCY_WEIGHT: &str = "relevance_recency_weight";
}

/// Read a raw value inside an existing transaction
pub(crate) fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM database_config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Parse `key` as `T`, falling back to `default` when absent or unparseable
pub(crate) fn read_parsed<T: FromStr>(conn: &Connection, key: &str, default: T) -> Result<T> {
    let Some(raw) = read_value(conn, key)? else {
        return Ok(default);
    };
    match raw.trim().parse() {
        Ok(value) => Ok(value),
        Err(_) => {
            tracing::debug!(key, value = %raw, "unparseable setting, using default");
            Ok(default)
        }
    }
}

pub(crate) fn read_all(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM database_config ORDER BY key")?;
    let entries = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(entries)
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(StoreError::invalid("config key must not be empty"));
    }
    Ok(())
}

/// Config Store over the `database_config` table
#[derive(Debug, Clone)]
pub struct ConfigStore {
    db: Arc<SqliteDatabase>,
}

impl ConfigStore {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        self.db.read(|conn| read_parsed(conn, key, default))
    }

    pub fn get_float(&self, key: &str, default: f64) -> Result<f64> {
        self.db.read(|conn| read_parsed(conn, key, default))
    }

    /// Accepts true/false, 1/0, yes/no, on/off (case-insensitive)
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let raw = self.db.read(|conn| read_value(conn, key))?;
        Ok(match raw.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("true" | "1" | "yes" | "on") => true,
            Some("false" | "0" | "no" | "off") => false,
            _ => default,
        })
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.db.read(|conn| read_value(conn, key))
    }

    /// Insert or replace a value
    pub fn set(&self, key: &str, value: impl ToString) -> Result<()> {
        validate_key(key)?;
        let value = value.to_string();
        let now = to_millis(Utc::now());

        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO database_config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })?;

        tracing::debug!(key, value = %value, "set config value");
        Ok(())
    }

    /// Store a value only if the key is absent; returns whether it was written
    pub fn set_if_absent(&self, key: &str, value: impl ToString) -> Result<bool> {
        validate_key(key)?;
        let value = value.to_string();
        let now = to_millis(Utc::now());

        let inserted = self.db.write(|tx| {
            Ok(tx.execute(
                "INSERT INTO database_config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, value, now],
            )?)
        })?;
        Ok(inserted > 0)
    }

    /// Remove a key; returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let deleted = self.db.write(|tx| {
            Ok(tx.execute("DELETE FROM database_config WHERE key = ?1", params![key])?)
        })?;
        Ok(deleted > 0)
    }

    /// Every stored entry, ordered by key
    pub fn all(&self) -> Result<BTreeMap<String, String>> {
        self.db.read(read_all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ensure_schema;

    fn store() -> Result<ConfigStore> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        ensure_schema(&db)?;
        Ok(ConfigStore::new(db))
    }

    #[test]
    fn test_missing_key_uses_default() -> Result<()> {
        let config = store()?;
        assert_eq!(config.get_int(keys::MAX_PROMPTS, 1000)?, 1000);
        assert_eq!(config.get_float(keys::MIN_RELEVANCE_SCORE, 0.3)?, 0.3);
        assert!(config.get_bool("auto_cleanup", true)?);
        assert_eq!(config.get_string("anything")?, None);
        Ok(())
    }

    #[test]
    fn test_set_and_read_back() -> Result<()> {
        let config = store()?;
        config.set(keys::MAX_PROMPTS, 250)?;
        config.set(keys::MIN_RELEVANCE_SCORE, 0.45)?;
        config.set("auto_cleanup", "off")?;

        assert_eq!(config.get_int(keys::MAX_PROMPTS, 1000)?, 250);
        assert_eq!(config.get_float(keys::MIN_RELEVANCE_SCORE, 0.3)?, 0.45);
        assert!(!config.get_bool("auto_cleanup", true)?);

        // overwrite
        config.set(keys::MAX_PROMPTS, 300)?;
        assert_eq!(config.get_int(keys::MAX_PROMPTS, 1000)?, 300);
        Ok(())
    }

    #[test]
    fn test_unparseable_value_falls_back() -> Result<()> {
        let config = store()?;
        config.set(keys::MAX_PROMPTS, "lots")?;
        config.set(keys::MIN_RELEVANCE_SCORE, "")?;

        assert_eq!(config.get_int(keys::MAX_PROMPTS, 1000)?, 1000);
        assert_eq!(config.get_float(keys::MIN_RELEVANCE_SCORE, 0.3)?, 0.3);
        // a float is not an int
        config.set(keys::MAX_PROMPTS, "12.5")?;
        assert_eq!(config.get_int(keys::MAX_PROMPTS, 7)?, 7);
        Ok(())
    }

    #[test]
    fn test_set_if_absent_remove_and_all() -> Result<()> {
        let config = store()?;
        assert!(config.set_if_absent(keys::MAX_PROMPTS, 10)?);
        assert!(!config.set_if_absent(keys::MAX_PROMPTS, 20)?);
        assert_eq!(config.get_int(keys::MAX_PROMPTS, 0)?, 10);

        config.set("theme", "dark")?;
        let all = config.all()?;
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("theme").map(String::as_str), Some("dark"));

        assert!(config.remove("theme")?);
        assert!(!config.remove("theme")?);
        assert!(config.set("  ", 1).is_err());
        Ok(())
    }
}
