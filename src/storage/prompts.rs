//! Prompt repository - CRUD over the `prompts` table
//!
//! Row mapping lives here and is shared with text and semantic search.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::interactions;
use super::search::effective_limit;
use super::types::{content_hash, from_millis, to_millis, NewPrompt, Phase, Prompt, PromptUpdate};
use crate::db::SqliteDatabase;
use crate::embeddings::{bytes_to_vec_f32, vec_f32_to_bytes};
use crate::error::{Result, StoreError};
use crate::graph;

/// Column list matching [`PromptRow::from_row`]
pub(crate) const PROMPT_COLUMNS: &str = "id, content, content_hash, phase, provider, model, \
     temperature, max_tokens, actual_tokens, tags, embedding, embedding_model, \
     embedding_dimensions, relevance_score, usage_count, last_used_at, created_at, updated_at";

/// Raw column values, decoded into a [`Prompt`] outside the rusqlite closure
pub(crate) struct PromptRow {
    id: String,
    content: String,
    content_hash: String,
    phase: String,
    provider: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    actual_tokens: u32,
    tags: String,
    embedding: Option<Vec<u8>>,
    embedding_model: Option<String>,
    embedding_dimensions: Option<usize>,
    relevance_score: f64,
    usage_count: u64,
    last_used_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl PromptRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            content_hash: row.get(2)?,
            phase: row.get(3)?,
            provider: row.get(4)?,
            model: row.get(5)?,
            temperature: row.get(6)?,
            max_tokens: row.get(7)?,
            actual_tokens: row.get(8)?,
            tags: row.get(9)?,
            embedding: row.get(10)?,
            embedding_model: row.get(11)?,
            embedding_dimensions: row.get(12)?,
            relevance_score: row.get(13)?,
            usage_count: row.get(14)?,
            last_used_at: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    pub(crate) fn into_prompt(self) -> Result<Prompt> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Serialization(format!("prompt id '{}': {}", self.id, e)))?;
        let phase: Phase = self
            .phase
            .parse()
            .map_err(|_| StoreError::Serialization(format!("prompt {} phase '{}'", id, self.phase)))?;
        let tags: BTreeSet<String> = serde_json::from_str(&self.tags)?;
        let embedding = self
            .embedding
            .as_deref()
            .map(bytes_to_vec_f32)
            .transpose()?;

        Ok(Prompt {
            id,
            content: self.content,
            content_hash: self.content_hash,
            phase,
            provider: self.provider,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            actual_tokens: self.actual_tokens,
            tags,
            embedding,
            embedding_model: self.embedding_model,
            embedding_dimensions: self.embedding_dimensions,
            relevance_score: self.relevance_score,
            usage_count: self.usage_count,
            last_used_at: self.last_used_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Run a prompt SELECT and decode every row
pub(crate) fn query_prompts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Prompt>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, PromptRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(PromptRow::into_prompt).collect()
}

/// Load a single prompt inside an existing transaction
pub(crate) fn load_prompt(conn: &Connection, id: &Uuid) -> Result<Option<Prompt>> {
    let sql = format!("SELECT {} FROM prompts WHERE id = ?1", PROMPT_COLUMNS);
    let row = conn
        .query_row(&sql, params![id.to_string()], PromptRow::from_row)
        .optional()?;

    row.map(PromptRow::into_prompt).transpose()
}

pub(crate) fn prompt_exists(conn: &Connection, id: &Uuid) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM prompts WHERE id = ?1)",
        params![id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Delete a prompt and every edge touching it
///
/// Must run inside the caller's transaction so the edge sweep and the row
/// delete commit together.
pub(crate) fn delete_prompt(conn: &Connection, id: &Uuid) -> Result<bool> {
    graph::delete_edges_touching(conn, id)?;
    interactions::delete_for_prompt(conn, id)?;
    let deleted = conn.execute("DELETE FROM prompts WHERE id = ?1", params![id.to_string()])?;
    Ok(deleted > 0)
}

/// CRUD over prompt records
#[derive(Debug, Clone)]
pub struct PromptRepository {
    db: Arc<SqliteDatabase>,
}

impl PromptRepository {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Persist a new prompt and return its assigned id
    pub fn create(&self, prompt: &NewPrompt) -> Result<Uuid> {
        prompt.validate()?;

        let id = Uuid::new_v4();
        let now = to_millis(Utc::now());
        let tags_json = serde_json::to_string(&prompt.tags)?;
        let embedding_bytes = prompt.embedding.as_deref().map(vec_f32_to_bytes);

        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO prompts (
                    id, content, content_hash, phase, provider, model, temperature,
                    max_tokens, actual_tokens, tags, embedding, embedding_model,
                    embedding_dimensions, relevance_score, usage_count, last_used_at,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, NULL, ?16, ?16)",
                params![
                    id.to_string(),
                    &prompt.content,
                    content_hash(&prompt.content),
                    prompt.phase.as_str(),
                    &prompt.provider,
                    &prompt.model,
                    prompt.temperature,
                    prompt.max_tokens,
                    prompt.actual_tokens,
                    tags_json,
                    embedding_bytes,
                    &prompt.embedding_model,
                    prompt.embedding_dimensions,
                    prompt.relevance_score,
                    prompt.usage_count,
                    now,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(prompt_id = %id, phase = %prompt.phase, "created prompt");
        Ok(id)
    }

    /// Fetch a prompt by id
    pub fn get(&self, id: &Uuid) -> Result<Prompt> {
        self.db
            .read(|conn| load_prompt(conn, id))?
            .ok_or_else(|| StoreError::not_found("prompt", id))
    }

    /// Apply the supplied fields and bump `updated_at`
    pub fn update(&self, id: &Uuid, update: &PromptUpdate) -> Result<Prompt> {
        update.validate()?;

        let updated = self.db.write(|tx| {
            let mut prompt =
                load_prompt(tx, id)?.ok_or_else(|| StoreError::not_found("prompt", id))?;

            if let Some(content) = &update.content {
                prompt.content_hash = content_hash(content);
                prompt.content = content.clone();
            }
            if let Some(tags) = &update.tags {
                prompt.tags = tags.clone();
            }
            if let Some(temperature) = update.temperature {
                prompt.temperature = temperature;
            }
            if let Some(max_tokens) = update.max_tokens {
                prompt.max_tokens = max_tokens;
            }
            if let Some(embedding) = &update.embedding {
                prompt.embedding_dimensions = Some(embedding.vector.len());
                prompt.embedding_model = Some(embedding.model.clone());
                prompt.embedding = Some(embedding.vector.clone());
            }
            prompt.updated_at = next_update_time(prompt.updated_at);

            tx.execute(
                "UPDATE prompts SET
                    content = ?2, content_hash = ?3, tags = ?4, temperature = ?5,
                    max_tokens = ?6, embedding = ?7, embedding_model = ?8,
                    embedding_dimensions = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    &prompt.content,
                    &prompt.content_hash,
                    serde_json::to_string(&prompt.tags)?,
                    prompt.temperature,
                    prompt.max_tokens,
                    prompt.embedding.as_deref().map(vec_f32_to_bytes),
                    &prompt.embedding_model,
                    prompt.embedding_dimensions,
                    to_millis(prompt.updated_at),
                ],
            )?;

            Ok(prompt)
        })?;

        tracing::debug!(prompt_id = %id, "updated prompt");
        Ok(updated)
    }

    /// Delete a prompt together with its relationship edges
    pub fn delete(&self, id: &Uuid) -> Result<()> {
        self.db.write(|tx| {
            if !prompt_exists(tx, id)? {
                return Err(StoreError::not_found("prompt", id));
            }
            delete_prompt(tx, id)?;
            Ok(())
        })?;

        tracing::debug!(prompt_id = %id, "deleted prompt");
        Ok(())
    }

    /// Count a read/consumption event; returns the new usage count
    pub fn record_usage(&self, id: &Uuid) -> Result<u64> {
        let now = to_millis(Utc::now());
        self.db.write(|tx| {
            let count: Option<u64> = tx
                .query_row(
                    "UPDATE prompts
                     SET usage_count = usage_count + 1,
                         last_used_at = ?2,
                         updated_at = MAX(?2, updated_at + 1)
                     WHERE id = ?1
                     RETURNING usage_count",
                    params![id.to_string(), now],
                    |row| row.get(0),
                )
                .optional()?;
            count.ok_or_else(|| StoreError::not_found("prompt", id))
        })
    }

    /// Most recent prompt whose content hashes to `hash`
    pub fn find_by_content_hash(&self, hash: &str) -> Result<Option<Prompt>> {
        let sql = format!(
            "SELECT {} FROM prompts WHERE content_hash = ?1 ORDER BY created_at DESC, id LIMIT 1",
            PROMPT_COLUMNS
        );
        let mut found = self.db.read(|conn| query_prompts(conn, &sql, params![hash]))?;
        Ok(found.pop())
    }

    pub fn count(&self) -> Result<u64> {
        self.db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))?)
        })
    }

    /// Newest first
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Prompt>> {
        self.list_ordered("created_at DESC, id", limit)
    }

    /// Most used first
    pub fn list_popular(&self, limit: usize) -> Result<Vec<Prompt>> {
        self.list_ordered("usage_count DESC, created_at DESC, id", limit)
    }

    /// Highest relevance first
    pub fn list_high_relevance(&self, limit: usize) -> Result<Vec<Prompt>> {
        self.list_ordered("relevance_score DESC, created_at DESC, id", limit)
    }

    /// Prompts awaiting (re-)embedding, oldest first
    pub fn list_without_embeddings(&self, limit: usize) -> Result<Vec<Prompt>> {
        let sql = format!(
            "SELECT {} FROM prompts WHERE embedding IS NULL ORDER BY created_at, id LIMIT ?1",
            PROMPT_COLUMNS
        );
        let limit = effective_limit(limit) as i64;
        self.db.read(|conn| query_prompts(conn, &sql, params![limit]))
    }

    fn list_ordered(&self, order_by: &str, limit: usize) -> Result<Vec<Prompt>> {
        let sql = format!(
            "SELECT {} FROM prompts ORDER BY {} LIMIT ?1",
            PROMPT_COLUMNS, order_by
        );
        let limit = effective_limit(limit) as i64;
        self.db.read(|conn| query_prompts(conn, &sql, params![limit]))
    }
}

/// `updated_at` for a mutation, strictly after the previous value
///
/// Timestamps are stored at millisecond precision, so two mutations in the same
/// millisecond would otherwise leave `updated_at` unchanged.
pub(crate) fn next_update_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + chrono::Duration::milliseconds(1);
    let next = Utc::now().max(floor);
    from_millis(to_millis(next)).unwrap_or(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ensure_schema;
    use crate::error::ErrorKind;
    use crate::storage::types::EmbeddingUpdate;

    fn repository() -> Result<PromptRepository> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        ensure_schema(&db)?;
        Ok(PromptRepository::new(db))
    }

    fn sample() -> NewPrompt {
        NewPrompt::new(
            "Write a haiku about databases",
            Phase::PrimaMateria,
            "openai",
            "gpt-4o-mini",
        )
        .with_tags(["poetry", "sql"])
        .with_generation(0.9, 512, 87)
        .with_embedding(vec![0.25, -0.5, 1.0], "text-embedding-3-small")
        .with_relevance(0.8)
    }

    #[test]
    fn test_create_get_roundtrip() -> Result<()> {
        let repo = repository()?;
        let input = sample();
        let id = repo.create(&input)?;

        let stored = repo.get(&id)?;
        assert_eq!(stored.id, id);
        assert_eq!(stored.content, input.content);
        assert_eq!(stored.phase, input.phase);
        assert_eq!(stored.provider, input.provider);
        assert_eq!(stored.model, input.model);
        assert_eq!(stored.temperature, input.temperature);
        assert_eq!(stored.max_tokens, input.max_tokens);
        assert_eq!(stored.actual_tokens, input.actual_tokens);
        assert_eq!(stored.tags, input.tags);
        assert_eq!(stored.embedding, input.embedding);
        assert_eq!(stored.embedding_model, input.embedding_model);
        assert_eq!(stored.embedding_dimensions, Some(3));
        assert_eq!(stored.relevance_score, input.relevance_score);
        assert_eq!(stored.usage_count, 0);
        assert_eq!(stored.content_hash, content_hash(&input.content));
        assert_eq!(stored.created_at, stored.updated_at);
        assert!(stored.last_used_at.is_none());

        Ok(())
    }

    #[test]
    fn test_create_rejects_inconsistent_embedding() -> Result<()> {
        let repo = repository()?;
        let mut input = sample();
        input.embedding_dimensions = Some(1536);

        let err = repo.create(&input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(repo.count()?, 0);

        Ok(())
    }

    #[test]
    fn test_get_missing_is_not_found() -> Result<()> {
        let repo = repository()?;
        let err = repo.get(&Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn test_update_replaces_only_supplied_fields() -> Result<()> {
        let repo = repository()?;
        let id = repo.create(&sample())?;
        let before = repo.get(&id)?;

        let updated = repo.update(
            &id,
            &PromptUpdate {
                content: Some("Write a limerick about indexes".to_string()),
                max_tokens: Some(256),
                ..Default::default()
            },
        )?;

        assert_eq!(updated.content, "Write a limerick about indexes");
        assert_eq!(updated.content_hash, content_hash("Write a limerick about indexes"));
        assert_eq!(updated.max_tokens, 256);
        assert_eq!(updated.tags, before.tags);
        assert_eq!(updated.temperature, before.temperature);
        assert_eq!(updated.embedding, before.embedding);
        assert_eq!(updated.created_at, before.created_at);
        assert!(updated.updated_at > before.updated_at);
        assert_eq!(repo.get(&id)?, updated);

        Ok(())
    }

    #[test]
    fn test_update_sets_new_embedding() -> Result<()> {
        let repo = repository()?;
        let id = repo.create(&NewPrompt::new("plain", Phase::Solutio, "ollama", "llama3"))?;

        let updated = repo.update(
            &id,
            &PromptUpdate {
                embedding: Some(EmbeddingUpdate {
                    vector: vec![1.0, 0.0, 0.0, 0.0],
                    model: "nomic-embed-text".to_string(),
                }),
                ..Default::default()
            },
        )?;

        assert_eq!(updated.embedding_dimensions, Some(4));
        assert_eq!(updated.embedding_model.as_deref(), Some("nomic-embed-text"));
        assert!(repo.get(&id)?.has_embedding());

        Ok(())
    }

    #[test]
    fn test_update_missing_is_not_found() -> Result<()> {
        let repo = repository()?;
        let err = repo
            .update(
                &Uuid::new_v4(),
                &PromptUpdate {
                    temperature: Some(0.2),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let repo = repository()?;
        let id = repo.create(&sample())?;

        repo.delete(&id)?;
        assert_eq!(repo.get(&id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(repo.delete(&id).unwrap_err().kind(), ErrorKind::NotFound);

        Ok(())
    }

    #[test]
    fn test_record_usage_increments() -> Result<()> {
        let repo = repository()?;
        let id = repo.create(&sample())?;

        assert_eq!(repo.record_usage(&id)?, 1);
        assert_eq!(repo.record_usage(&id)?, 2);

        let stored = repo.get(&id)?;
        assert_eq!(stored.usage_count, 2);
        assert!(stored.last_used_at.is_some());

        let err = repo.record_usage(&Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        Ok(())
    }

    #[test]
    fn test_find_by_content_hash() -> Result<()> {
        let repo = repository()?;
        let input = sample();
        let id = repo.create(&input)?;

        let found = repo.find_by_content_hash(&content_hash(&input.content))?;
        assert_eq!(found.map(|p| p.id), Some(id));
        assert!(repo.find_by_content_hash(&content_hash("other"))?.is_none());

        Ok(())
    }

    #[test]
    fn test_list_views() -> Result<()> {
        let repo = repository()?;
        let used = repo.create(&sample().with_relevance(0.2))?;
        let plain = repo.create(&NewPrompt::new("bare", Phase::Coagulatio, "google", "gemini"))?;
        repo.record_usage(&used)?;

        assert_eq!(repo.list_popular(1)?[0].id, used);
        assert_eq!(repo.list_high_relevance(1)?[0].id, plain);

        let pending = repo.list_without_embeddings(10)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, plain);

        assert_eq!(repo.list_recent(0)?.len(), 2);

        Ok(())
    }
}
