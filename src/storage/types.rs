//! Domain types for the storage layer
//!
//! These types are storage-agnostic - they don't know about SQLite.
//! The repository handles serialization/deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::embeddings::validate_vector;
use crate::error::{Result, StoreError};

/// Longest accepted tag
pub const MAX_TAG_LEN: usize = 64;

/// Pipeline stage that produced a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Raw idea / first draft
    PrimaMateria,
    /// Humanized, natural phrasing
    Solutio,
    /// Precision pass, final form
    Coagulatio,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PrimaMateria => "prima-materia",
            Phase::Solutio => "solutio",
            Phase::Coagulatio => "coagulatio",
        }
    }

    /// All phases in pipeline order
    pub fn all() -> &'static [Phase] {
        &[Phase::PrimaMateria, Phase::Solutio, Phase::Coagulatio]
    }
}

impl FromStr for Phase {
    type Err = StoreError;

    /// Accepts current names and the legacy idea/human/precision aliases
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "prima-materia" | "prima_materia" | "idea" | "draft" => Ok(Phase::PrimaMateria),
            "solutio" | "human" | "humanize" => Ok(Phase::Solutio),
            "coagulatio" | "precision" => Ok(Phase::Coagulatio),
            other => Err(StoreError::invalid(format!("unknown phase '{}'", other))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted prompt candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: Uuid,
    pub content: String,
    /// SHA-256 of `content`, hex encoded
    pub content_hash: String,
    pub phase: Phase,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub actual_tokens: u32,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
    /// Decaying priority in [0, 1], written by the lifecycle manager
    pub relevance_score: f64,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prompt {
    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Input for creating a prompt
///
/// `id`, `content_hash` and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrompt {
    pub content: String,
    pub phase: Phase,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub actual_tokens: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dimensions: Option<usize>,
    pub relevance_score: f64,
    #[serde(default)]
    pub usage_count: u64,
}

impl NewPrompt {
    pub fn new(
        content: impl Into<String>,
        phase: Phase,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            phase,
            provider: provider.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2000,
            actual_tokens: 0,
            tags: BTreeSet::new(),
            embedding: None,
            embedding_model: None,
            embedding_dimensions: None,
            relevance_score: 1.0,
            usage_count: 0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an embedding; dimensions are taken from the vector length
    pub fn with_embedding(mut self, embedding: Vec<f32>, model: impl Into<String>) -> Self {
        self.embedding_dimensions = Some(embedding.len());
        self.embedding = Some(embedding);
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = score;
        self
    }

    pub fn with_generation(mut self, temperature: f64, max_tokens: u32, actual_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self.actual_tokens = actual_tokens;
        self
    }

    /// Check field ranges and embedding metadata consistency
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(StoreError::invalid("content must not be empty"));
        }
        if self.provider.trim().is_empty() {
            return Err(StoreError::invalid("provider must not be empty"));
        }
        validate_temperature(self.temperature)?;
        if !(0.0..=1.0).contains(&self.relevance_score) {
            return Err(StoreError::invalid(format!(
                "relevance_score {} outside [0, 1]",
                self.relevance_score
            )));
        }
        validate_tags(&self.tags)?;

        match &self.embedding {
            Some(vector) => {
                let dimensions = match self.embedding_dimensions {
                    Some(d) if d > 0 => d,
                    _ => {
                        return Err(StoreError::invalid(
                            "embedding present but embedding_dimensions missing or zero",
                        ))
                    }
                };
                match self.embedding_model.as_deref() {
                    Some(m) if !m.trim().is_empty() => {}
                    _ => {
                        return Err(StoreError::invalid(
                            "embedding present but embedding_model missing",
                        ))
                    }
                }
                if vector.len() != dimensions {
                    return Err(StoreError::Conflict(format!(
                        "embedding has {} components but embedding_dimensions is {}",
                        vector.len(),
                        dimensions
                    )));
                }
                validate_vector(vector)?;
            }
            None => {
                if self.embedding_model.is_some() || self.embedding_dimensions.is_some() {
                    return Err(StoreError::invalid(
                        "embedding_model/embedding_dimensions given without an embedding",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// A replacement embedding supplied after re-embedding a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingUpdate {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Caller-mutable fields; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptUpdate {
    pub content: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub embedding: Option<EmbeddingUpdate>,
}

impl PromptUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(content) = &self.content {
            if content.trim().is_empty() {
                return Err(StoreError::invalid("content must not be empty"));
            }
        }
        if let Some(temperature) = self.temperature {
            validate_temperature(temperature)?;
        }
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        if let Some(embedding) = &self.embedding {
            if embedding.model.trim().is_empty() {
                return Err(StoreError::invalid("embedding model must not be empty"));
            }
            validate_vector(&embedding.vector)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.tags.is_none()
            && self.temperature.is_none()
            && self.max_tokens.is_none()
            && self.embedding.is_none()
    }
}

fn validate_temperature(temperature: f64) -> Result<()> {
    if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
        return Err(StoreError::invalid(format!(
            "temperature {} outside [0, 2]",
            temperature
        )));
    }
    Ok(())
}

fn validate_tags(tags: &BTreeSet<String>) -> Result<()> {
    for tag in tags {
        if tag.trim().is_empty() {
            return Err(StoreError::invalid("tags must not be blank"));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(StoreError::invalid(format!(
                "tag '{}' longer than {} bytes",
                tag, MAX_TAG_LEN
            )));
        }
    }
    Ok(())
}

/// Hex SHA-256 of prompt content
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Smallest stored millisecond not earlier than `ts`
pub(crate) fn to_millis_ceil(ts: DateTime<Utc>) -> i64 {
    let millis = ts.timestamp_millis();
    if ts.timestamp_subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp {} out of range", ms)))
}
