//! Relationship graph between prompts
//!
//! Directed, typed, weighted edges stored next to the prompts they connect.
//! Edges are removed together with either endpoint.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::SqliteDatabase;
use crate::error::{Result, StoreError};
use crate::storage::prompts::prompt_exists;
use crate::storage::types::{from_millis, to_millis};

/// Edge types - how one prompt relates to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Target was produced by refining source
    DerivedFrom,
    /// Near-duplicate content
    SimilarTo,
    /// Source seeded the idea behind target
    InspiredBy,
    /// Target combines source with other prompts
    MergedWith,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::DerivedFrom => "derived_from",
            RelationshipType::SimilarTo => "similar_to",
            RelationshipType::InspiredBy => "inspired_by",
            RelationshipType::MergedWith => "merged_with",
        }
    }

    /// All relationship types for iteration
    pub fn all() -> &'static [RelationshipType] {
        &[
            RelationshipType::DerivedFrom,
            RelationshipType::SimilarTo,
            RelationshipType::InspiredBy,
            RelationshipType::MergedWith,
        ]
    }
}

impl FromStr for RelationshipType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "derived_from" => Ok(RelationshipType::DerivedFrom),
            "similar_to" => Ok(RelationshipType::SimilarTo),
            "inspired_by" => Ok(RelationshipType::InspiredBy),
            "merged_with" => Ok(RelationshipType::MergedWith),
            _ => Err(StoreError::invalid(format!(
                "unknown relationship type '{}' (expected one of derived_from, similar_to, inspired_by, merged_with)",
                s
            ))),
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge between two prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relationship_type: RelationshipType,
    /// Edge weight in [0, 1]
    pub strength: f64,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

const RELATIONSHIP_COLUMNS: &str =
    "id, source_id, target_id, relationship_type, strength, context, created_at";

/// Raw edge columns in [`RELATIONSHIP_COLUMNS`] order
type EdgeRow = (i64, String, String, String, f64, Option<String>, i64);

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<EdgeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_relationship(
    (id, source, target, kind, strength, context, created_at): EdgeRow,
) -> Result<Relationship> {
    let parse_id = |raw: &str| {
        Uuid::parse_str(raw).map_err(|e| {
            StoreError::Serialization(format!("relationship {} endpoint '{}': {}", id, raw, e))
        })
    };

    Ok(Relationship {
        id,
        source_id: parse_id(&source)?,
        target_id: parse_id(&target)?,
        relationship_type: kind
            .parse()
            .map_err(|_| StoreError::Serialization(format!("relationship {} type '{}'", id, kind)))?,
        strength,
        context,
        created_at: from_millis(created_at)?,
    })
}

/// Delete every edge where `id` is source or target
///
/// Runs inside the caller's transaction so it commits with the prompt delete.
pub(crate) fn delete_edges_touching(conn: &Connection, id: &Uuid) -> Result<usize> {
    let id = id.to_string();
    let deleted = conn.execute(
        "DELETE FROM prompt_relationships WHERE source_id = ?1 OR target_id = ?1",
        params![id],
    )?;
    Ok(deleted)
}

/// Edge counts grouped by type, inside an existing read
pub(crate) fn count_by_type(conn: &Connection) -> Result<BTreeMap<RelationshipType, u64>> {
    let mut stmt = conn.prepare(
        "SELECT relationship_type, COUNT(*) FROM prompt_relationships GROUP BY relationship_type",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut counts = BTreeMap::new();
    for (kind, count) in rows {
        match kind.parse::<RelationshipType>() {
            Ok(kind) => {
                counts.insert(kind, count);
            }
            Err(_) => tracing::warn!(relationship_type = %kind, count, "skipping unknown relationship type"),
        }
    }
    Ok(counts)
}

/// The relationship graph
#[derive(Debug, Clone)]
pub struct RelationshipGraph {
    db: Arc<SqliteDatabase>,
}

impl RelationshipGraph {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Edge Operations
    // =========================================================================

    /// Add an edge, or replace strength/context of an existing one
    pub fn add_relationship(
        &self,
        source: &Uuid,
        target: &Uuid,
        relationship_type: RelationshipType,
        strength: f64,
        context: Option<&str>,
    ) -> Result<Relationship> {
        if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
            return Err(StoreError::invalid(format!(
                "strength {} outside [0, 1]",
                strength
            )));
        }
        if source == target {
            return Err(StoreError::invalid("a prompt cannot relate to itself"));
        }

        let now = to_millis(Utc::now());

        let relationship = self.db.write(|tx| {
            for endpoint in [source, target] {
                if !prompt_exists(tx, endpoint)? {
                    return Err(StoreError::not_found("prompt", endpoint));
                }
            }

            let (id, created_at): (i64, i64) = tx.query_row(
                r#"
                INSERT INTO prompt_relationships
                    (source_id, target_id, relationship_type, strength, context, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(source_id, target_id, relationship_type) DO UPDATE SET
                    strength = excluded.strength,
                    context = excluded.context
                RETURNING id, created_at
                "#,
                params![
                    source.to_string(),
                    target.to_string(),
                    relationship_type.as_str(),
                    strength,
                    context,
                    now
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(Relationship {
                id,
                source_id: *source,
                target_id: *target,
                relationship_type,
                strength,
                context: context.map(str::to_string),
                created_at: from_millis(created_at)?,
            })
        })?;

        tracing::debug!(
            source = %source,
            target = %target,
            relationship_type = %relationship_type,
            strength,
            "added relationship"
        );
        Ok(relationship)
    }

    /// Remove a single edge; returns whether it existed
    pub fn remove_relationship(
        &self,
        source: &Uuid,
        target: &Uuid,
        relationship_type: RelationshipType,
    ) -> Result<bool> {
        let deleted = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM prompt_relationships
                 WHERE source_id = ?1 AND target_id = ?2 AND relationship_type = ?3",
                params![source.to_string(), target.to_string(), relationship_type.as_str()],
            )?)
        })?;
        Ok(deleted > 0)
    }

    /// Delete every edge touching `id`; returns how many were removed
    pub fn remove_for_record(&self, id: &Uuid) -> Result<usize> {
        let deleted = self.db.write(|tx| delete_edges_touching(tx, id))?;
        tracing::debug!(prompt_id = %id, deleted, "removed relationships for prompt");
        Ok(deleted)
    }

    /// Edges where `id` is source or target, oldest first
    pub fn relationships_for(&self, id: &Uuid) -> Result<Vec<Relationship>> {
        let sql = format!(
            "SELECT {} FROM prompt_relationships
             WHERE source_id = ?1 OR target_id = ?1
             ORDER BY created_at, id",
            RELATIONSHIP_COLUMNS
        );

        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![id.to_string()], relationship_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(decode_relationship).collect()
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Edge counts grouped by type
    pub fn stats_by_type(&self) -> Result<BTreeMap<RelationshipType, u64>> {
        self.db.read(count_by_type)
    }

    /// Count edges
    pub fn count(&self) -> Result<u64> {
        self.db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM prompt_relationships", [], |row| {
                row.get(0)
            })?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ensure_schema;
    use crate::error::ErrorKind;
    use crate::storage::{NewPrompt, Phase, PromptRepository};

    fn setup() -> Result<(PromptRepository, RelationshipGraph)> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        ensure_schema(&db)?;
        Ok((PromptRepository::new(db.clone()), RelationshipGraph::new(db)))
    }

    fn prompt(repo: &PromptRepository, content: &str) -> Result<Uuid> {
        repo.create(&NewPrompt::new(content, Phase::PrimaMateria, "openai", "gpt-4o"))
    }

    #[test]
    fn test_relationship_type_parse() {
        assert_eq!(
            "derived_from".parse::<RelationshipType>().unwrap(),
            RelationshipType::DerivedFrom
        );
        assert_eq!(
            "Similar-To".parse::<RelationshipType>().unwrap(),
            RelationshipType::SimilarTo
        );
        let err = "contradicts".parse::<RelationshipType>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        for kind in RelationshipType::all() {
            assert_eq!(kind.as_str().parse::<RelationshipType>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_add_and_list_relationship() -> Result<()> {
        let (repo, graph) = setup()?;
        let draft = prompt(&repo, "draft")?;
        let final_ = prompt(&repo, "final")?;

        let edge = graph.add_relationship(
            &final_,
            &draft,
            RelationshipType::DerivedFrom,
            0.8,
            Some("precision pass"),
        )?;
        assert_eq!(edge.source_id, final_);
        assert_eq!(edge.target_id, draft);

        let edges = graph.relationships_for(&draft)?;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0], edge);
        assert_eq!(graph.relationships_for(&final_)?, edges);

        Ok(())
    }

    #[test]
    fn test_re_adding_replaces_strength() -> Result<()> {
        let (repo, graph) = setup()?;
        let a = prompt(&repo, "a")?;
        let b = prompt(&repo, "b")?;

        let first = graph.add_relationship(&a, &b, RelationshipType::SimilarTo, 0.4, None)?;
        let second = graph.add_relationship(&a, &b, RelationshipType::SimilarTo, 0.9, Some("rescored"))?;

        assert_eq!(first.id, second.id);
        assert_eq!(graph.count()?, 1);
        let stored = &graph.relationships_for(&a)?[0];
        assert_eq!(stored.strength, 0.9);
        assert_eq!(stored.context.as_deref(), Some("rescored"));

        Ok(())
    }

    #[test]
    fn test_rejects_bad_input() -> Result<()> {
        let (repo, graph) = setup()?;
        let a = prompt(&repo, "a")?;
        let b = prompt(&repo, "b")?;

        let strength = graph
            .add_relationship(&a, &b, RelationshipType::InspiredBy, 1.5, None)
            .unwrap_err();
        assert_eq!(strength.kind(), ErrorKind::InvalidArgument);

        let self_edge = graph
            .add_relationship(&a, &a, RelationshipType::InspiredBy, 0.5, None)
            .unwrap_err();
        assert_eq!(self_edge.kind(), ErrorKind::InvalidArgument);

        let missing = graph
            .add_relationship(&a, &Uuid::new_v4(), RelationshipType::InspiredBy, 0.5, None)
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(graph.count()?, 0);

        Ok(())
    }

    #[test]
    fn test_remove_for_record_and_stats() -> Result<()> {
        let (repo, graph) = setup()?;
        let a = prompt(&repo, "a")?;
        let b = prompt(&repo, "b")?;
        let c = prompt(&repo, "c")?;

        graph.add_relationship(&a, &b, RelationshipType::DerivedFrom, 1.0, None)?;
        graph.add_relationship(&c, &a, RelationshipType::MergedWith, 0.5, None)?;
        graph.add_relationship(&b, &c, RelationshipType::MergedWith, 0.5, None)?;

        let stats = graph.stats_by_type()?;
        assert_eq!(stats.get(&RelationshipType::MergedWith), Some(&2));
        assert_eq!(stats.get(&RelationshipType::DerivedFrom), Some(&1));
        assert_eq!(stats.get(&RelationshipType::SimilarTo), None);

        assert_eq!(graph.remove_for_record(&a)?, 2);
        assert_eq!(graph.count()?, 1);

        assert!(graph.remove_relationship(&b, &c, RelationshipType::MergedWith)?);
        assert!(!graph.remove_relationship(&b, &c, RelationshipType::MergedWith)?);

        Ok(())
    }

    #[test]
    fn test_deleting_prompt_removes_edges() -> Result<()> {
        let (repo, graph) = setup()?;
        let a = prompt(&repo, "a")?;
        let b = prompt(&repo, "b")?;
        graph.add_relationship(&a, &b, RelationshipType::SimilarTo, 0.7, None)?;

        repo.delete(&b)?;
        assert!(graph.relationships_for(&a)?.is_empty());
        assert_eq!(graph.count()?, 0);

        Ok(())
    }
}
