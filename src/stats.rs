//! Store-wide statistics
//!
//! Gathered in a single read snapshot so every figure describes the same
//! state of the store.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{schema, SqliteDatabase};
use crate::error::Result;
use crate::graph::{count_by_type, RelationshipType};
use crate::migration::{embedding_stats, EmbeddingModelCount};
use crate::settings::read_all;
use crate::storage::Phase;

/// Usage analytics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub total_usage: u64,
    pub average_usage: f64,
    pub prompts_with_usage: u64,
    pub max_usage: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub schema_version: i64,
    pub total_prompts: u64,
    pub prompts_with_embeddings: u64,
    /// Percentage in [0, 100]
    pub embedding_coverage: f64,
    pub average_relevance: f64,
    pub by_phase: BTreeMap<Phase, u64>,
    pub by_provider: BTreeMap<String, u64>,
    pub configuration: BTreeMap<String, String>,
    pub relationships: BTreeMap<RelationshipType, u64>,
    pub total_relationships: u64,
    pub usage: UsageStats,
    pub total_interactions: u64,
    pub embedding_models: Vec<EmbeddingModelCount>,
}

impl StoreStatistics {
    pub fn collect(db: &SqliteDatabase) -> Result<Self> {
        let stats = db.read(collect)?;
        tracing::debug!(
            total_prompts = stats.total_prompts,
            relationships = stats.total_relationships,
            "collected statistics"
        );
        Ok(stats)
    }
}

fn collect(conn: &Connection) -> Result<StoreStatistics> {
    let embeddings = embedding_stats(conn)?;

    let average_relevance: f64 = conn.query_row(
        "SELECT COALESCE(AVG(relevance_score), 0.0) FROM prompts",
        [],
        |row| row.get(0),
    )?;

    let mut by_phase = BTreeMap::new();
    for (phase, count) in grouped_counts(conn, "phase")? {
        match phase.parse::<Phase>() {
            Ok(phase) => *by_phase.entry(phase).or_insert(0) += count,
            Err(_) => tracing::warn!(phase = %phase, count, "skipping unknown phase in statistics"),
        }
    }
    let by_provider = grouped_counts(conn, "provider")?.into_iter().collect();

    let usage = conn.query_row(
        "SELECT COALESCE(SUM(usage_count), 0), COALESCE(AVG(usage_count), 0.0),
                COUNT(*) FILTER (WHERE usage_count > 0), COALESCE(MAX(usage_count), 0)
         FROM prompts",
        [],
        |row| {
            Ok(UsageStats {
                total_usage: row.get(0)?,
                average_usage: row.get(1)?,
                prompts_with_usage: row.get(2)?,
                max_usage: row.get(3)?,
            })
        },
    )?;

    let relationships = count_by_type(conn)?;
    let total_interactions: u64 =
        conn.query_row("SELECT COUNT(*) FROM user_interactions", [], |row| row.get(0))?;

    Ok(StoreStatistics {
        schema_version: schema::current_version(conn)?,
        total_prompts: embeddings.total_prompts,
        prompts_with_embeddings: embeddings.prompts_with_embeddings,
        embedding_coverage: embeddings.embedding_coverage,
        average_relevance,
        by_phase,
        by_provider,
        configuration: read_all(conn)?,
        total_relationships: relationships.values().sum(),
        relationships,
        usage,
        total_interactions,
        embedding_models: embeddings.models,
    })
}

/// `(value, count)` for a text column of `prompts`
fn grouped_counts(conn: &Connection, column: &str) -> Result<Vec<(String, u64)>> {
    let sql = format!(
        "SELECT {col}, COUNT(*) FROM prompts GROUP BY {col} ORDER BY {col}",
        col = column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
