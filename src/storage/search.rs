//! Filtered text search over prompts
//!
//! [`SearchFilter`] is shared with semantic search. Supplied fields combine
//! with AND; `tags` matches a prompt carrying at least one requested tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::prompts::{query_prompts, PROMPT_COLUMNS};
use super::types::{to_millis_ceil, Phase, Prompt};
use crate::db::SqliteDatabase;
use crate::error::Result;

/// Result count used when a caller passes `limit == 0`
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Hard cap on any single result set
pub const MAX_SEARCH_LIMIT: usize = 1000;

/// Clamp a caller limit into `1..=MAX_SEARCH_LIMIT`
pub fn effective_limit(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_SEARCH_LIMIT
    } else {
        limit.min(MAX_SEARCH_LIMIT)
    }
}

/// Filter predicates for text and semantic search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub phase: Option<Phase>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Match prompts carrying any of these tags (empty = no tag filter)
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Lower bound on `created_at`, inclusive
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring of `content` (ASCII folding only)
    pub text: Option<String>,
    /// Lower bound on `relevance_score`, inclusive
    #[serde(default)]
    pub min_relevance: Option<f64>,
    /// 0 means [`DEFAULT_SEARCH_LIMIT`]
    #[serde(default)]
    pub limit: usize,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn min_relevance(mut self, score: f64) -> Self {
        self.min_relevance = Some(score);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// True when `prompt` satisfies every supplied predicate
    pub fn matches(&self, prompt: &Prompt) -> bool {
        self.phase.map_or(true, |p| prompt.phase == p)
            && self.provider.as_ref().map_or(true, |p| &prompt.provider == p)
            && self.model.as_ref().map_or(true, |m| &prompt.model == m)
            && (self.tags.is_empty() || !self.tags.is_disjoint(&prompt.tags))
            && self.since.map_or(true, |s| prompt.created_at >= s)
            && self.text.as_ref().map_or(true, |t| {
                prompt
                    .content
                    .to_ascii_lowercase()
                    .contains(&t.to_ascii_lowercase())
            })
            && self
                .min_relevance
                .map_or(true, |min| prompt.relevance_score >= min)
    }

    /// SQL predicates (each prefixed with `AND`) and their parameters
    pub(crate) fn where_clause(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut sql = String::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(phase) = self.phase {
            sql.push_str(" AND phase = ?");
            params.push(Box::new(phase.as_str()));
        }
        if let Some(provider) = &self.provider {
            sql.push_str(" AND provider = ?");
            params.push(Box::new(provider.clone()));
        }
        if let Some(model) = &self.model {
            sql.push_str(" AND model = ?");
            params.push(Box::new(model.clone()));
        }
        if !self.tags.is_empty() {
            let placeholders: Vec<_> = self.tags.iter().map(|_| "?").collect();
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(prompts.tags) WHERE json_each.value IN ({}))",
                placeholders.join(", ")
            ));
            for tag in &self.tags {
                params.push(Box::new(tag.clone()));
            }
        }
        if let Some(since) = self.since {
            // stored timestamps are whole milliseconds
            sql.push_str(" AND created_at >= ?");
            params.push(Box::new(to_millis_ceil(since)));
        }
        if let Some(text) = &self.text {
            sql.push_str(" AND instr(lower(content), lower(?)) > 0");
            params.push(Box::new(text.clone()));
        }
        if let Some(min) = self.min_relevance {
            sql.push_str(" AND relevance_score >= ?");
            params.push(Box::new(min));
        }

        (sql, params)
    }
}

/// Common result shape for text and semantic search
///
/// `similarities` is parallel to `prompts` for semantic search and `None` for
/// text search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub prompts: Vec<Prompt>,
    pub similarities: Option<Vec<f32>>,
}

impl SearchResults {
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Iterate prompts paired with their similarity (if any)
    pub fn iter(&self) -> impl Iterator<Item = (&Prompt, Option<f32>)> {
        self.prompts.iter().enumerate().map(move |(i, p)| {
            (p, self.similarities.as_ref().and_then(|s| s.get(i).copied()))
        })
    }
}

/// Text search over prompt metadata
#[derive(Debug, Clone)]
pub struct TextSearch {
    db: Arc<SqliteDatabase>,
}

impl TextSearch {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Prompts matching `filter`, most recent first
    pub fn search(&self, filter: &SearchFilter) -> Result<SearchResults> {
        let limit = effective_limit(filter.limit);
        let (predicates, mut params) = filter.where_clause();
        params.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {} FROM prompts WHERE 1 = 1{} ORDER BY created_at DESC, id LIMIT ?",
            PROMPT_COLUMNS, predicates
        );

        let prompts = self.db.read(|conn| {
            query_prompts(
                conn,
                &sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            )
        })?;

        tracing::debug!(results = prompts.len(), limit, "text search");

        Ok(SearchResults {
            prompts,
            similarities: None,
        })
    }
}
