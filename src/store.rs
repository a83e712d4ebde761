//! `PromptStore` - one handle over every store component
//!
//! Components share a single [`SqliteDatabase`]. The store is `Send + Sync`;
//! wrap it in an `Arc` to use it from several threads.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{EmbeddingsSection, StoreConfig};
use crate::db::{schema, SqliteDatabase, DEFAULT_BUSY_TIMEOUT_MS};
use crate::error::{Result, StoreError};
use crate::graph::{Relationship, RelationshipGraph, RelationshipType};
use crate::lifecycle::{
    CleanupReport, LifecycleManager, MaintenanceOptions, MaintenanceReport, RelevanceReport,
};
use crate::migration::{EmbeddingStats, MigrationManager, MigrationOptions, MigrationReport};
use crate::settings::ConfigStore;
use crate::stats::StoreStatistics;
use crate::storage::{
    Interaction, InteractionLog, NewInteraction, NewPrompt, Prompt, PromptRepository,
    PromptUpdate, SearchFilter, SearchResults, SemanticQuery, SemanticSearch, TextSearch,
};

/// Persistent prompt store
#[derive(Debug, Clone)]
pub struct PromptStore {
    db: Arc<SqliteDatabase>,
    prompts: PromptRepository,
    text: TextSearch,
    semantic: SemanticSearch,
    graph: RelationshipGraph,
    interactions: InteractionLog,
    config: ConfigStore,
    lifecycle: LifecycleManager,
    migration: MigrationManager,
    embeddings: EmbeddingsSection,
}

impl PromptStore {
    /// Open (or create) a store file and bring its schema up to date
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = SqliteDatabase::open(path, DEFAULT_BUSY_TIMEOUT_MS)?;
        Self::from_database(db)
    }

    /// Fresh in-memory store, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_database(SqliteDatabase::open_in_memory()?)
    }

    /// Open the configured database and seed lifecycle settings that are absent
    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StoreError::invalid(format!("{:#}", e)))?;

        let db = SqliteDatabase::open(config.database_path(), config.database.busy_timeout_ms)?;
        let mut store = Self::from_database(db)?;
        store.embeddings = config.embeddings.clone();

        let mut seeded = 0;
        for (key, value) in config.lifecycle.entries() {
            if store.config.set_if_absent(key, value)? {
                seeded += 1;
            }
        }
        if seeded > 0 {
            tracing::info!(seeded, "seeded lifecycle settings");
        }

        Ok(store)
    }

    fn from_database(db: SqliteDatabase) -> Result<Self> {
        let version = schema::ensure_schema(&db)?;
        tracing::debug!(schema_version = version, "prompt store ready");

        let db = Arc::new(db);
        let config = ConfigStore::new(db.clone());
        Ok(Self {
            prompts: PromptRepository::new(db.clone()),
            text: TextSearch::new(db.clone()),
            semantic: SemanticSearch::new(db.clone()),
            graph: RelationshipGraph::new(db.clone()),
            interactions: InteractionLog::new(db.clone()),
            lifecycle: LifecycleManager::new(db.clone(), config.clone()),
            migration: MigrationManager::new(db.clone()),
            embeddings: EmbeddingsSection::default(),
            config,
            db,
        })
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub fn prompts(&self) -> &PromptRepository {
        &self.prompts
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn interactions(&self) -> &InteractionLog {
        &self.interactions
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn migration(&self) -> &MigrationManager {
        &self.migration
    }

    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn create(&self, prompt: &NewPrompt) -> Result<Uuid> {
        self.prompts.create(prompt)
    }

    pub fn get(&self, id: &Uuid) -> Result<Prompt> {
        self.prompts.get(id)
    }

    pub fn update(&self, id: &Uuid, update: &PromptUpdate) -> Result<Prompt> {
        self.prompts.update(id, update)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        self.prompts.delete(id)
    }

    pub fn search_text(&self, filter: &SearchFilter) -> Result<SearchResults> {
        self.text.search(filter)
    }

    pub fn search_semantic(&self, query: &SemanticQuery) -> Result<SearchResults> {
        self.semantic.search(query)
    }

    /// Relate two prompts; `relationship_type` is parsed from its string name
    pub fn relate(
        &self,
        source: &Uuid,
        target: &Uuid,
        relationship_type: &str,
        strength: f64,
        context: Option<&str>,
    ) -> Result<Relationship> {
        let relationship_type: RelationshipType = relationship_type.parse()?;
        self.graph
            .add_relationship(source, target, relationship_type, strength, context)
    }

    pub fn record_interaction(&self, interaction: &NewInteraction) -> Result<Interaction> {
        self.interactions.record(interaction)
    }

    pub fn list_interactions(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Interaction>> {
        self.interactions.list_since(since, limit)
    }

    pub fn migrate(
        &self,
        target_model: &str,
        target_dimensions: usize,
        batch_size: usize,
    ) -> Result<MigrationReport> {
        self.migration.migrate(target_model, target_dimensions, batch_size)
    }

    pub fn migrate_with(
        &self,
        target_model: &str,
        target_dimensions: usize,
        options: &MigrationOptions,
    ) -> Result<MigrationReport> {
        self.migration
            .migrate_with(target_model, target_dimensions, options)
    }

    /// Migrate to the configured standard embedding model and dimensions
    pub fn standardize_embeddings(&self) -> Result<MigrationReport> {
        self.migration.migrate(
            &self.embeddings.standard_model,
            self.embeddings.standard_dimensions,
            self.embeddings.batch_size,
        )
    }

    pub fn embedding_target(&self) -> &EmbeddingsSection {
        &self.embeddings
    }

    pub fn embedding_stats(&self) -> Result<EmbeddingStats> {
        self.migration.embedding_stats()
    }

    pub fn update_relevance_scores(&self) -> Result<RelevanceReport> {
        self.lifecycle.update_relevance_scores()
    }

    pub fn cleanup_old_prompts(&self, dry_run: bool) -> Result<CleanupReport> {
        self.lifecycle.cleanup_old_prompts(dry_run)
    }

    pub fn run_maintenance(&self, options: &MaintenanceOptions) -> Result<MaintenanceReport> {
        self.lifecycle.run_maintenance(options)
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        StoreStatistics::collect(&self.db)
    }
}
