//! Embedding migration - invalidates vectors from a superseded model or shape
//!
//! When the embedding model or its dimensionality changes, stored vectors are
//! no longer comparable with new ones. Migration clears `embedding`,
//! `embedding_model` and `embedding_dimensions` on every record that does not
//! match the target, leaving it for the generation pipeline to re-embed.
//!
//! Records are visited in id order. The cursor lives in `migration_state` and
//! advances in the same transaction as the batch it covers, so an interrupted
//! run resumes exactly where the last committed batch ended.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::SqliteDatabase;
use crate::embeddings::MAX_EMBEDDING_DIMENSIONS;
use crate::error::{Result, StoreError};
use crate::storage::types::{from_millis, to_millis};

/// Records visited per transaction when the caller passes 0
pub const DEFAULT_MIGRATION_BATCH_SIZE: usize = 10;

/// Embedding model new records are expected to use
pub const STANDARD_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const STANDARD_EMBEDDING_DIMENSIONS: usize = 1536;

/// Tuning for a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Records per batch (0 means [`DEFAULT_MIGRATION_BATCH_SIZE`])
    pub batch_size: usize,
    /// Stop after this many batches, leaving the run resumable
    pub max_batches: Option<usize>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            max_batches: None,
        }
    }
}

/// Result of a migration call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub target_model: String,
    pub target_dimensions: usize,
    /// Records visited since the run started (including resumed progress)
    pub scanned: u64,
    /// Embeddings cleared since the run started
    pub cleared: u64,
    /// Batches committed by this call
    pub batches: usize,
    /// True when this call continued an unfinished run
    pub resumed: bool,
    /// False when `max_batches` stopped the run early
    pub completed: bool,
}

/// Persisted cursor for one target `(model, dimensions)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationState {
    pub target_model: String,
    pub target_dimensions: usize,
    pub last_id: String,
    pub scanned: u64,
    pub cleared: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Count of stored vectors for one model/shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingModelCount {
    pub model: String,
    pub dimensions: usize,
    pub count: u64,
}

/// Embedding coverage across the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingStats {
    pub total_prompts: u64,
    pub prompts_with_embeddings: u64,
    /// Percentage in [0, 100]
    pub embedding_coverage: f64,
    /// Largest group first
    pub models: Vec<EmbeddingModelCount>,
}

impl EmbeddingStats {
    /// True when every stored vector already matches the target
    pub fn is_standardized(&self, model: &str, dimensions: usize) -> bool {
        self.models
            .iter()
            .all(|m| m.model == model && m.dimensions == dimensions)
    }
}

fn validate_target(model: &str, dimensions: usize) -> Result<()> {
    if model.trim().is_empty() {
        return Err(StoreError::invalid("target embedding model must not be empty"));
    }
    if dimensions == 0 || dimensions > MAX_EMBEDDING_DIMENSIONS {
        return Err(StoreError::invalid(format!(
            "target dimensions {} outside 1..={}",
            dimensions, MAX_EMBEDDING_DIMENSIONS
        )));
    }
    Ok(())
}

fn missing_state(model: &str, dimensions: usize) -> StoreError {
    StoreError::Conflict(format!(
        "migration state for {}/{} was removed mid-run",
        model, dimensions
    ))
}

fn load_state(
    conn: &Connection,
    model: &str,
    dimensions: usize,
) -> Result<Option<MigrationState>> {
    let row = conn
        .query_row(
            "SELECT last_id, scanned, cleared, started_at, completed_at FROM migration_state
             WHERE target_model = ?1 AND target_dimensions = ?2",
            params![model, dimensions],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(last_id, scanned, cleared, started_at, completed_at)| {
        Ok(MigrationState {
            target_model: model.to_string(),
            target_dimensions: dimensions,
            last_id,
            scanned,
            cleared,
            started_at: from_millis(started_at)?,
            completed_at: completed_at.map(from_millis).transpose()?,
        })
    })
    .transpose()
}

/// Outcome of one committed batch
struct BatchStep {
    visited: usize,
    finished: bool,
}

/// Clear mismatched embeddings in the next batch and advance the cursor
fn migrate_batch(
    conn: &Connection,
    model: &str,
    dimensions: usize,
    batch_size: usize,
) -> Result<BatchStep> {
    let state = load_state(conn, model, dimensions)?
        .ok_or_else(|| missing_state(model, dimensions))?;
    if state.completed_at.is_some() {
        return Ok(BatchStep {
            visited: 0,
            finished: true,
        });
    }

    let mut stmt =
        conn.prepare_cached("SELECT id FROM prompts WHERE id > ?1 ORDER BY id LIMIT ?2")?;
    let ids = stmt
        .query_map(params![state.last_id, batch_size as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = to_millis(Utc::now());
    let Some(batch_end) = ids.last() else {
        conn.execute(
            "UPDATE migration_state SET completed_at = ?3
             WHERE target_model = ?1 AND target_dimensions = ?2",
            params![model, dimensions, now],
        )?;
        return Ok(BatchStep {
            visited: 0,
            finished: true,
        });
    };

    let cleared = conn.execute(
        "UPDATE prompts
         SET embedding = NULL, embedding_model = NULL, embedding_dimensions = NULL,
             updated_at = MAX(?5, updated_at + 1)
         WHERE id > ?1 AND id <= ?2
           AND embedding IS NOT NULL
           AND (COALESCE(embedding_model, '') != ?3 OR COALESCE(embedding_dimensions, 0) != ?4)",
        params![state.last_id, batch_end, model, dimensions, now],
    )?;

    let finished = ids.len() < batch_size;
    conn.execute(
        "UPDATE migration_state
         SET last_id = ?3, scanned = scanned + ?4, cleared = cleared + ?5,
             completed_at = CASE WHEN ?6 THEN ?7 ELSE NULL END
         WHERE target_model = ?1 AND target_dimensions = ?2",
        params![model, dimensions, batch_end, ids.len() as i64, cleared as i64, finished, now],
    )?;

    Ok(BatchStep {
        visited: ids.len(),
        finished,
    })
}

/// Standardizes stored embeddings on a target model/shape
#[derive(Debug, Clone)]
pub struct MigrationManager {
    db: Arc<SqliteDatabase>,
}

impl MigrationManager {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Clear every embedding that does not match `(model, dimensions)`
    pub fn migrate(
        &self,
        model: &str,
        dimensions: usize,
        batch_size: usize,
    ) -> Result<MigrationReport> {
        self.migrate_with(
            model,
            dimensions,
            &MigrationOptions {
                batch_size,
                max_batches: None,
            },
        )
    }

    pub fn migrate_with(
        &self,
        model: &str,
        dimensions: usize,
        options: &MigrationOptions,
    ) -> Result<MigrationReport> {
        validate_target(model, dimensions)?;
        let batch_size = match options.batch_size {
            0 => DEFAULT_MIGRATION_BATCH_SIZE,
            n => n,
        };

        // Resume an unfinished run, otherwise start over from the first id
        let resumed = self.db.write(|tx| {
            let now = to_millis(Utc::now());
            match load_state(tx, model, dimensions)? {
                Some(state) if state.completed_at.is_none() => Ok(true),
                Some(_) => {
                    tx.execute(
                        "UPDATE migration_state
                         SET last_id = '', scanned = 0, cleared = 0, started_at = ?3, completed_at = NULL
                         WHERE target_model = ?1 AND target_dimensions = ?2",
                        params![model, dimensions, now],
                    )?;
                    Ok(false)
                }
                None => {
                    tx.execute(
                        "INSERT INTO migration_state (target_model, target_dimensions, started_at)
                         VALUES (?1, ?2, ?3)",
                        params![model, dimensions, now],
                    )?;
                    Ok(false)
                }
            }
        })?;

        if resumed {
            tracing::info!(model, dimensions, "resuming embedding migration");
        }

        let mut batches = 0usize;
        let mut completed = false;
        while options.max_batches.map_or(true, |max| batches < max) {
            let step = self
                .db
                .write(|tx| migrate_batch(tx, model, dimensions, batch_size))?;
            if step.visited > 0 {
                batches += 1;
            }
            if step.finished {
                completed = true;
                break;
            }
        }

        let state = self
            .state(model, dimensions)?
            .ok_or_else(|| missing_state(model, dimensions))?;

        let report = MigrationReport {
            target_model: model.to_string(),
            target_dimensions: dimensions,
            scanned: state.scanned,
            cleared: state.cleared,
            batches,
            resumed,
            completed,
        };

        tracing::info!(
            model,
            dimensions,
            scanned = report.scanned,
            cleared = report.cleared,
            batches,
            completed,
            "embedding migration"
        );
        Ok(report)
    }

    /// How many embeddings a migration to `(model, dimensions)` would clear
    pub fn plan(&self, model: &str, dimensions: usize) -> Result<u64> {
        validate_target(model, dimensions)?;
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM prompts
                 WHERE embedding IS NOT NULL
                   AND (COALESCE(embedding_model, '') != ?1 OR COALESCE(embedding_dimensions, 0) != ?2)",
                params![model, dimensions],
                |row| row.get(0),
            )?)
        })
    }

    /// Persisted progress for a target, if a run was ever started
    pub fn state(&self, model: &str, dimensions: usize) -> Result<Option<MigrationState>> {
        self.db.read(|conn| load_state(conn, model, dimensions))
    }

    pub fn embedding_stats(&self) -> Result<EmbeddingStats> {
        self.db.read(embedding_stats)
    }
}

/// Embedding coverage inside an existing read
pub(crate) fn embedding_stats(conn: &Connection) -> Result<EmbeddingStats> {
    let (total_prompts, prompts_with_embeddings): (u64, u64) = conn.query_row(
        "SELECT COUNT(*), COUNT(embedding) FROM prompts",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT COALESCE(embedding_model, ''), COALESCE(embedding_dimensions, 0), COUNT(*)
         FROM prompts WHERE embedding IS NOT NULL
         GROUP BY 1, 2 ORDER BY 3 DESC, 1, 2",
    )?;
    let models = stmt
        .query_map([], |row| {
            Ok(EmbeddingModelCount {
                model: row.get(0)?,
                dimensions: row.get(1)?,
                count: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let embedding_coverage = if total_prompts == 0 {
        0.0
    } else {
        prompts_with_embeddings as f64 / total_prompts as f64 * 100.0
    };

    Ok(EmbeddingStats {
        total_prompts,
        prompts_with_embeddings,
        embedding_coverage,
        models,
    })
}
