//! alembic - persistent prompt store
//!
//! Stores generated prompts with their embeddings and metadata in a single
//! SQLite file, and provides:
//!
//! - filtered text search and cosine-similarity search sharing one result shape
//! - a typed, weighted relationship graph between prompts
//! - a log of user interactions (chosen, skipped, rated) per prompt
//! - resumable migration of embeddings to a new model or dimensionality
//! - relevance decay and capacity-bounded cleanup driven by persisted settings
//!
//! # Example
//!
//! ```no_run
//! use alembic::{NewPrompt, Phase, PromptStore, SemanticQuery};
//!
//! let store = PromptStore::open("prompts.db")?;
//! let id = store.create(
//!     &NewPrompt::new("Explain borrow checking", Phase::PrimaMateria, "openai", "gpt-4o")
//!         .with_embedding(vec![0.1, 0.7, 0.2], "text-embedding-3-small"),
//! )?;
//!
//! let hits = store.search_semantic(&SemanticQuery::new(vec![0.1, 0.7, 0.2]).min_similarity(0.8))?;
//! assert_eq!(hits.prompts[0].id, id);
//! # Ok::<(), alembic::StoreError>(())
//! ```

pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod migration;
pub mod settings;
pub mod stats;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use config::StoreConfig;
pub use error::{ErrorKind, Result, StoreError};
pub use graph::{Relationship, RelationshipGraph, RelationshipType};
pub use lifecycle::{CleanupReport, LifecycleManager, MaintenanceOptions, MaintenanceReport};
pub use migration::{EmbeddingStats, MigrationManager, MigrationOptions, MigrationReport};
pub use settings::ConfigStore;
pub use stats::StoreStatistics;
pub use storage::{
    Interaction, InteractionAction, NewInteraction, NewPrompt, Phase, Prompt, PromptUpdate,
    SearchFilter, SearchResults, SemanticQuery,
};
pub use store::PromptStore;
