//! Storage layer for prompt records
//!
//! SQLite holds the records, their embeddings (as BLOBs) and the metadata
//! every search filters on. Text and semantic search share one filter type and
//! one result shape.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use alembic::db::{schema, SqliteDatabase};
//! use alembic::storage::{NewPrompt, Phase, PromptRepository, SearchFilter, TextSearch};
//!
//! let db = Arc::new(SqliteDatabase::open_in_memory()?);
//! schema::ensure_schema(&db)?;
//!
//! let repo = PromptRepository::new(db.clone());
//! repo.create(&NewPrompt::new("Draft a release note", Phase::PrimaMateria, "openai", "gpt-4o"))?;
//!
//! let hits = TextSearch::new(db).search(&SearchFilter::new().provider("openai"))?;
//! assert_eq!(hits.len(), 1);
//! # Ok::<(), alembic::StoreError>(())
//! ```

pub mod interactions;
pub mod prompts;
pub mod search;
pub mod semantic;
pub mod types;

pub use interactions::{Interaction, InteractionAction, InteractionLog, NewInteraction};
pub use prompts::PromptRepository;
pub use search::{
    effective_limit, SearchFilter, SearchResults, TextSearch, DEFAULT_SEARCH_LIMIT,
    MAX_SEARCH_LIMIT,
};
pub use semantic::{SemanticQuery, SemanticSearch};
pub use types::{content_hash, EmbeddingUpdate, NewPrompt, Phase, Prompt, PromptUpdate, MAX_TAG_LEN};
