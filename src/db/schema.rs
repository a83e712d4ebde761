//! Versioned schema for the prompt database
//!
//! Each step is applied at most once, inside its own transaction, and recorded
//! in `schema_version`. `ensure_schema` is safe to call on every open.

use chrono::Utc;
use rusqlite::{params, Connection};

use super::SqliteDatabase;
use crate::error::Result;

/// Ordered schema steps: (version, DDL)
const SCHEMA_STEPS: &[(i64, &str)] = &[
    (
        1,
        r#"
        -- Candidate records produced by the generation pipeline
        CREATE TABLE IF NOT EXISTS prompts (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            phase TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            temperature REAL NOT NULL DEFAULT 0.7,
            max_tokens INTEGER NOT NULL DEFAULT 0,
            actual_tokens INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            embedding BLOB,
            embedding_model TEXT,
            embedding_dimensions INTEGER,
            relevance_score REAL NOT NULL DEFAULT 1.0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Maintenance thresholds and operational settings
        CREATE TABLE IF NOT EXISTS database_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        2,
        r#"
        -- Directed, typed edges between prompts
        CREATE TABLE IF NOT EXISTS prompt_relationships (
            id INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 0.5,
            context TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (source_id) REFERENCES prompts(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES prompts(id) ON DELETE CASCADE,
            UNIQUE(source_id, target_id, relationship_type)
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_source ON prompt_relationships(source_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON prompt_relationships(target_id);
        "#,
    ),
    (
        3,
        r#"
        -- Cursor for resumable embedding migrations, one row per target shape
        CREATE TABLE IF NOT EXISTS migration_state (
            target_model TEXT NOT NULL,
            target_dimensions INTEGER NOT NULL,
            last_id TEXT NOT NULL DEFAULT '',
            scanned INTEGER NOT NULL DEFAULT 0,
            cleared INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            PRIMARY KEY (target_model, target_dimensions)
        );
        "#,
    ),
    (
        4,
        r#"
        CREATE INDEX IF NOT EXISTS idx_prompts_created ON prompts(created_at);
        CREATE INDEX IF NOT EXISTS idx_prompts_phase ON prompts(phase);
        CREATE INDEX IF NOT EXISTS idx_prompts_provider ON prompts(provider);
        CREATE INDEX IF NOT EXISTS idx_prompts_relevance ON prompts(relevance_score, created_at);
        CREATE INDEX IF NOT EXISTS idx_prompts_embedding_shape ON prompts(embedding_dimensions, embedding_model);
        CREATE INDEX IF NOT EXISTS idx_prompts_content_hash ON prompts(content_hash);
        "#,
    ),
    (
        5,
        r#"
        -- Feedback on prompts offered to a user (chosen, skipped, rated)
        CREATE TABLE IF NOT EXISTS user_interactions (
            id TEXT PRIMARY KEY,
            prompt_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            action TEXT NOT NULL,
            score REAL NOT NULL DEFAULT 0,
            recorded_at INTEGER NOT NULL,
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_interactions_recorded ON user_interactions(recorded_at);
        CREATE INDEX IF NOT EXISTS idx_interactions_prompt ON user_interactions(prompt_id);
        "#,
    ),
];

/// Latest schema version this build knows about
pub fn latest_version() -> i64 {
    SCHEMA_STEPS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Apply every pending schema step; returns the resulting version
pub fn ensure_schema(db: &SqliteDatabase) -> Result<i64> {
    db.write(|tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    })?;

    let current = db.read(current_version)?;

    for (version, ddl) in SCHEMA_STEPS.iter().filter(|(v, _)| *v > current) {
        db.write(|tx| {
            // Another handle may have applied this step since we looked
            let applied: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_version WHERE version = ?1)",
                params![version],
                |row| row.get(0),
            )?;
            if applied {
                return Ok(());
            }

            tx.execute_batch(ddl)?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })?;

        tracing::info!(version, "applied schema step");
    }

    db.read(current_version)
}

/// Highest applied schema version (0 for a fresh database)
pub fn current_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
