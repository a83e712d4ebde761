//! Store configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! yields a working configuration.
//!
//! ```toml
//! [database]
//! path = "~/.prompt-alchemy/prompts.db"
//! busy_timeout_ms = 5000
//!
//! [lifecycle]
//! max_prompts = 1000
//! min_relevance_score = 0.3
//!
//! [embeddings]
//! standard_model = "text-embedding-3-small"
//! standard_dimensions = 1536
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::DEFAULT_BUSY_TIMEOUT_MS;
use crate::embeddings::MAX_EMBEDDING_DIMENSIONS;
use crate::lifecycle::{
    DEFAULT_HALF_LIFE_DAYS, DEFAULT_MAX_PROMPTS, DEFAULT_MIN_RELEVANCE_SCORE,
    DEFAULT_PROTECT_RELEVANCE_SCORE, DEFAULT_RECENCY_WEIGHT, DEFAULT_USAGE_SATURATION,
};
use crate::migration::{
    DEFAULT_MIGRATION_BATCH_SIZE, STANDARD_EMBEDDING_DIMENSIONS, STANDARD_EMBEDDING_MODEL,
};
use crate::settings::keys;

/// Top-level store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: DatabaseSection,
    pub lifecycle: LifecycleSection,
    pub embeddings: EmbeddingsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Database file; a leading `~/` expands to the home directory
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Seeded into the Config Store on first open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub max_prompts: u64,
    pub min_relevance_score: f64,
    pub protect_relevance_score: f64,
    pub relevance_half_life_days: f64,
    pub relevance_usage_saturation: f64,
    pub relevance_recency_weight: f64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_prompts: DEFAULT_MAX_PROMPTS,
            min_relevance_score: DEFAULT_MIN_RELEVANCE_SCORE,
            protect_relevance_score: DEFAULT_PROTECT_RELEVANCE_SCORE,
            relevance_half_life_days: DEFAULT_HALF_LIFE_DAYS,
            relevance_usage_saturation: DEFAULT_USAGE_SATURATION,
            relevance_recency_weight: DEFAULT_RECENCY_WEIGHT,
        }
    }
}

impl LifecycleSection {
    /// Config Store entries for these settings
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (keys::MAX_PROMPTS, self.max_prompts.to_string()),
            (keys::MIN_RELEVANCE_SCORE, self.min_relevance_score.to_string()),
            (keys::PROTECT_RELEVANCE_SCORE, self.protect_relevance_score.to_string()),
            (keys::RELEVANCE_HALF_LIFE_DAYS, self.relevance_half_life_days.to_string()),
            (keys::RELEVANCE_USAGE_SATURATION, self.relevance_usage_saturation.to_string()),
            (keys::RELEVANCE_RECENCY_WEIGHT, self.relevance_recency_weight.to_string()),
        ]
    }
}

/// Target shape for embedding migrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsSection {
    pub standard_model: String,
    pub standard_dimensions: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingsSection {
    fn default() -> Self {
        Self {
            standard_model: STANDARD_EMBEDDING_MODEL.to_string(),
            standard_dimensions: STANDARD_EMBEDDING_DIMENSIONS,
            batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prompt-alchemy")
        .join("prompts.db")
}

impl StoreConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::load_from_str(&content)
    }

    /// Load configuration from string
    pub fn load_from_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse store configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }

        let lifecycle = &self.lifecycle;
        for (name, value) in [
            ("min_relevance_score", lifecycle.min_relevance_score),
            ("protect_relevance_score", lifecycle.protect_relevance_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("lifecycle.{} must be within [0, 1], got {}", name, value);
            }
        }
        let weight = lifecycle.relevance_recency_weight;
        if !(weight > 0.0 && weight < 1.0) {
            anyhow::bail!(
                "lifecycle.relevance_recency_weight must be within (0, 1), got {}",
                weight
            );
        }
        for (name, value) in [
            ("relevance_half_life_days", lifecycle.relevance_half_life_days),
            ("relevance_usage_saturation", lifecycle.relevance_usage_saturation),
        ] {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("lifecycle.{} must be positive, got {}", name, value);
            }
        }

        let embeddings = &self.embeddings;
        if embeddings.standard_model.trim().is_empty() {
            anyhow::bail!("embeddings.standard_model must not be empty");
        }
        if embeddings.standard_dimensions == 0
            || embeddings.standard_dimensions > MAX_EMBEDDING_DIMENSIONS
        {
            anyhow::bail!(
                "embeddings.standard_dimensions must be within 1..={}, got {}",
                MAX_EMBEDDING_DIMENSIONS,
                embeddings.standard_dimensions
            );
        }

        Ok(())
    }

    /// Database path with a leading `~/` expanded
    pub fn database_path(&self) -> PathBuf {
        let path = &self.database.path;
        match (path.strip_prefix("~"), dirs::home_dir()) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => path.clone(),
        }
    }
}
