//! Embedding similarity search
//!
//! Two passes inside one read snapshot:
//! 1. stream `(id, created_at, embedding)` for filtered candidates in keyset
//!    batches, score each batch in parallel and keep the best `limit` hits
//! 2. load the full records for the winners
//!
//! Only records whose `embedding_dimensions` equals the query length are
//! considered, so mixed-generation histories never produce a dimension error.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use uuid::Uuid;

use super::prompts::load_prompt;
use super::search::{effective_limit, SearchFilter, SearchResults};
use crate::db::SqliteDatabase;
use crate::embeddings::{bytes_to_vec_f32, cosine_similarity, validate_vector};
use crate::error::{Result, StoreError};

/// Rows fetched per scan batch
const SCAN_BATCH_SIZE: i64 = 256;

/// A semantic query: vector, similarity floor and the shared filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub embedding: Vec<f32>,
    /// Results below this cosine similarity are dropped; must lie in [0, 1]
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default)]
    pub filter: SearchFilter,
}

impl SemanticQuery {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            ..Default::default()
        }
    }

    pub fn min_similarity(mut self, threshold: f32) -> Self {
        self.min_similarity = threshold;
        self
    }

    pub fn filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.filter.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_vector(&self.embedding)?;
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(StoreError::invalid(format!(
                "min_similarity {} outside [0, 1]",
                self.min_similarity
            )));
        }
        Ok(())
    }
}

/// Candidate hit kept in the bounded heap
///
/// Greater means better: higher similarity, then more recent, then lower id.
#[derive(Debug, Clone)]
struct Ranked {
    similarity: f32,
    created_at: i64,
    id: String,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Cosine similarity search over stored embeddings
#[derive(Debug, Clone)]
pub struct SemanticSearch {
    db: Arc<SqliteDatabase>,
}

impl SemanticSearch {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Records most similar to `query.embedding`, best first
    ///
    /// `similarities` in the result is parallel to `prompts`, non-increasing,
    /// and every value is at least `query.min_similarity`.
    pub fn search(&self, query: &SemanticQuery) -> Result<SearchResults> {
        query.validate()?;

        let limit = effective_limit(query.filter.limit);
        let dimensions = query.embedding.len() as i64;
        let (predicates, filter_params) = query.filter.where_clause();
        let sql = format!(
            "SELECT id, created_at, embedding FROM prompts
             WHERE id > ? AND embedding IS NOT NULL AND embedding_dimensions = ?{}
             ORDER BY id LIMIT ?",
            predicates
        );

        let (results, scanned) = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(limit + 1);
            let mut last_id = String::new();
            let mut scanned = 0usize;

            loop {
                let mut batch_params: Vec<&dyn rusqlite::ToSql> = vec![&last_id, &dimensions];
                batch_params.extend(filter_params.iter().map(|p| p.as_ref()));
                batch_params.push(&SCAN_BATCH_SIZE);

                let rows = stmt
                    .query_map(rusqlite::params_from_iter(batch_params), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let Some((tail_id, _, _)) = rows.last() else {
                    break;
                };
                let next_id = tail_id.clone();
                scanned += rows.len();

                let hits = rows
                    .par_iter()
                    .map(|(id, created_at, blob)| {
                        let vector = bytes_to_vec_f32(blob)?;
                        if vector.len() != query.embedding.len() {
                            return Ok(None);
                        }
                        let similarity = cosine_similarity(&query.embedding, &vector);
                        Ok((similarity >= query.min_similarity).then(|| Ranked {
                            similarity,
                            created_at: *created_at,
                            id: id.clone(),
                        }))
                    })
                    .collect::<Result<Vec<Option<Ranked>>>>()?;

                for hit in hits.into_iter().flatten() {
                    heap.push(Reverse(hit));
                    if heap.len() > limit {
                        heap.pop();
                    }
                }

                if rows.len() < SCAN_BATCH_SIZE as usize {
                    break;
                }
                last_id = next_id;
            }

            // into_sorted_vec on Reverse yields best first
            let ranked: Vec<Ranked> = heap.into_sorted_vec().into_iter().map(|r| r.0).collect();

            let mut prompts = Vec::with_capacity(ranked.len());
            let mut similarities = Vec::with_capacity(ranked.len());
            for hit in &ranked {
                let id = Uuid::parse_str(&hit.id).map_err(|e| {
                    StoreError::Serialization(format!("prompt id '{}': {}", hit.id, e))
                })?;
                if let Some(prompt) = load_prompt(conn, &id)? {
                    prompts.push(prompt);
                    similarities.push(hit.similarity);
                }
            }

            Ok((
                SearchResults {
                    prompts,
                    similarities: Some(similarities),
                },
                scanned,
            ))
        })?;

        tracing::debug!(
            dimensions,
            scanned,
            results = results.len(),
            min_similarity = query.min_similarity,
            "semantic search"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ensure_schema;
    use crate::error::ErrorKind;
    use crate::storage::{NewPrompt, Phase, PromptRepository};
    use approx::assert_relative_eq;

    fn setup() -> Result<(PromptRepository, SemanticSearch)> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        ensure_schema(&db)?;
        Ok((PromptRepository::new(db.clone()), SemanticSearch::new(db)))
    }

    fn embedded(content: &str, vector: Vec<f32>) -> NewPrompt {
        NewPrompt::new(content, Phase::Solutio, "openai", "gpt-4o")
            .with_embedding(vector, "text-embedding-3-small")
    }

    #[test]
    fn test_threshold_keeps_only_close_match() -> Result<()> {
        let (repo, search) = setup()?;
        let x = repo.create(&embedded("x axis", vec![1.0, 0.0]))?;
        repo.create(&embedded("y axis", vec![0.0, 1.0]))?;

        let results = search.search(&SemanticQuery::new(vec![1.0, 0.0]).min_similarity(0.5))?;

        assert_eq!(results.len(), 1);
        assert_eq!(results.prompts[0].id, x);
        let similarities = results.similarities.unwrap();
        assert_relative_eq!(similarities[0], 1.0, epsilon = 1e-6);

        Ok(())
    }

    #[test]
    fn test_no_embeddings_is_empty_not_error() -> Result<()> {
        let (repo, search) = setup()?;
        repo.create(&NewPrompt::new("no vector", Phase::Solutio, "openai", "gpt-4o"))?;

        let results = search.search(&SemanticQuery::new(vec![0.3, 0.4]))?;
        assert!(results.is_empty());
        assert_eq!(results.similarities, Some(vec![]));

        Ok(())
    }

    #[test]
    fn test_malformed_query_is_invalid() -> Result<()> {
        let (_, search) = setup()?;

        let empty = search.search(&SemanticQuery::new(vec![])).unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::InvalidArgument);

        let huge = search
            .search(&SemanticQuery::new(vec![0.1; crate::embeddings::MAX_EMBEDDING_DIMENSIONS + 1]))
            .unwrap_err();
        assert_eq!(huge.kind(), ErrorKind::InvalidArgument);

        let threshold = search
            .search(&SemanticQuery::new(vec![1.0]).min_similarity(1.5))
            .unwrap_err();
        assert_eq!(threshold.kind(), ErrorKind::InvalidArgument);

        Ok(())
    }

    #[test]
    fn test_dimension_mismatch_is_excluded() -> Result<()> {
        let (repo, search) = setup()?;
        let two = repo.create(&embedded("two dims", vec![1.0, 0.0]))?;
        // Identical direction but three components
        repo.create(&embedded("three dims", vec![1.0, 0.0, 0.0]))?;

        let results = search.search(&SemanticQuery::new(vec![1.0, 0.0]))?;
        assert_eq!(results.len(), 1);
        assert_eq!(results.prompts[0].id, two);

        Ok(())
    }

    #[test]
    fn test_ordering_limit_and_filters() -> Result<()> {
        let (repo, search) = setup()?;
        for i in 0..600 {
            let angle = i as f32 / 600.0;
            let phase = if i % 2 == 0 { Phase::Solutio } else { Phase::Coagulatio };
            repo.create(
                &NewPrompt::new(format!("p{}", i), phase, "openai", "gpt-4o")
                    .with_embedding(vec![1.0 - angle, angle, 0.1], "m"),
            )?;
        }

        let query = SemanticQuery::new(vec![1.0, 0.0, 0.0])
            .min_similarity(0.2)
            .filter(SearchFilter::new().phase(Phase::Coagulatio).limit(25));
        let results = search.search(&query)?;
        let similarities = results.similarities.clone().unwrap();

        assert_eq!(results.len(), 25);
        assert_eq!(similarities.len(), 25);
        assert!(similarities.windows(2).all(|w| w[0] >= w[1]));
        assert!(similarities.iter().all(|s| *s >= 0.2));
        assert!(results.prompts.iter().all(|p| p.phase == Phase::Coagulatio));
        // Closest odd index to the x axis is p1
        assert_eq!(results.prompts[0].content, "p1");

        Ok(())
    }

    #[test]
    fn test_relevance_floor_keeps_high_quality_only() -> Result<()> {
        let (repo, search) = setup()?;
        let strong = repo.create(&embedded("strong", vec![1.0, 0.1]).with_relevance(0.9))?;
        repo.create(&embedded("weak but closer", vec![1.0, 0.0]).with_relevance(0.2))?;

        let query = SemanticQuery::new(vec![1.0, 0.0])
            .filter(SearchFilter::new().min_relevance(0.7));
        let results = search.search(&query)?;

        assert_eq!(results.len(), 1);
        assert_eq!(results.prompts[0].id, strong);
        Ok(())
    }
}
