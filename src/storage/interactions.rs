//! User interactions with generated prompts
//!
//! Each row records what a user did with one prompt offered during a
//! generation session. Rows go away with their prompt.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::prompts::prompt_exists;
use super::search::effective_limit;
use super::types::{from_millis, to_millis, to_millis_ceil};
use crate::db::SqliteDatabase;
use crate::error::{Result, StoreError};

/// What the user did with a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Chosen,
    Skipped,
    Rated,
}

impl InteractionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionAction::Chosen => "chosen",
            InteractionAction::Skipped => "skipped",
            InteractionAction::Rated => "rated",
        }
    }
}

impl FromStr for InteractionAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chosen" => Ok(InteractionAction::Chosen),
            "skipped" => Ok(InteractionAction::Skipped),
            "rated" => Ok(InteractionAction::Rated),
            other => Err(StoreError::invalid(format!(
                "unknown interaction action '{}' (expected chosen, skipped or rated)",
                other
            ))),
        }
    }
}

impl fmt::Display for InteractionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub prompt_id: Uuid,
    /// Groups the interactions of one generation request
    pub session_id: Uuid,
    pub action: InteractionAction,
    /// Rating in [0, 1]; 0 for unrated actions
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Input for [`InteractionLog::record`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInteraction {
    pub prompt_id: Uuid,
    pub session_id: Uuid,
    pub action: InteractionAction,
    #[serde(default)]
    pub score: f64,
}

impl NewInteraction {
    pub fn new(prompt_id: Uuid, session_id: Uuid, action: InteractionAction) -> Self {
        Self {
            prompt_id,
            session_id,
            action,
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

const INTERACTION_COLUMNS: &str = "id, prompt_id, session_id, action, score, recorded_at";

type InteractionRow = (String, String, String, String, f64, i64);

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<InteractionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_interaction(
    (id, prompt_id, session_id, action, score, recorded_at): InteractionRow,
) -> Result<Interaction> {
    let parse_id = |raw: &str| {
        Uuid::parse_str(raw)
            .map_err(|e| StoreError::Serialization(format!("interaction id '{}': {}", raw, e)))
    };

    Ok(Interaction {
        id: parse_id(&id)?,
        prompt_id: parse_id(&prompt_id)?,
        session_id: parse_id(&session_id)?,
        action: action.parse().map_err(|_| {
            StoreError::Serialization(format!("interaction {} action '{}'", id, action))
        })?,
        score,
        recorded_at: from_millis(recorded_at)?,
    })
}

/// Delete every interaction of `id` inside the caller's transaction
pub(crate) fn delete_for_prompt(conn: &Connection, id: &Uuid) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM user_interactions WHERE prompt_id = ?1",
        params![id.to_string()],
    )?)
}

/// Append-only log of user interactions
#[derive(Debug, Clone)]
pub struct InteractionLog {
    db: Arc<SqliteDatabase>,
}

impl InteractionLog {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Record an interaction against an existing prompt
    pub fn record(&self, interaction: &NewInteraction) -> Result<Interaction> {
        if !interaction.score.is_finite() || !(0.0..=1.0).contains(&interaction.score) {
            return Err(StoreError::invalid(format!(
                "interaction score {} outside [0, 1]",
                interaction.score
            )));
        }

        let id = Uuid::new_v4();
        let now = to_millis(Utc::now());

        self.db.write(|tx| {
            if !prompt_exists(tx, &interaction.prompt_id)? {
                return Err(StoreError::not_found("prompt", interaction.prompt_id));
            }
            tx.execute(
                "INSERT INTO user_interactions (id, prompt_id, session_id, action, score, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    interaction.prompt_id.to_string(),
                    interaction.session_id.to_string(),
                    interaction.action.as_str(),
                    interaction.score,
                    now
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            prompt_id = %interaction.prompt_id,
            action = %interaction.action,
            "recorded interaction"
        );

        Ok(Interaction {
            id,
            prompt_id: interaction.prompt_id,
            session_id: interaction.session_id,
            action: interaction.action,
            score: interaction.score,
            recorded_at: from_millis(now)?,
        })
    }

    /// Interactions recorded at or after `since`, newest first
    pub fn list_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Interaction>> {
        let sql = format!(
            "SELECT {} FROM user_interactions
             WHERE recorded_at >= ?1
             ORDER BY recorded_at DESC, id
             LIMIT ?2",
            INTERACTION_COLUMNS
        );
        let limit = effective_limit(limit) as i64;

        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![to_millis_ceil(since), limit], interaction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(decode_interaction).collect()
    }

    /// Every interaction with one prompt, oldest first
    pub fn for_prompt(&self, prompt_id: &Uuid) -> Result<Vec<Interaction>> {
        let sql = format!(
            "SELECT {} FROM user_interactions WHERE prompt_id = ?1 ORDER BY recorded_at, id",
            INTERACTION_COLUMNS
        );

        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![prompt_id.to_string()], interaction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(decode_interaction).collect()
    }

    pub fn count(&self) -> Result<u64> {
        self.db.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM user_interactions", [], |row| row.get(0))?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ensure_schema;
    use crate::error::ErrorKind;
    use crate::storage::{NewPrompt, Phase, PromptRepository};

    fn setup() -> Result<(PromptRepository, InteractionLog)> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        ensure_schema(&db)?;
        Ok((PromptRepository::new(db.clone()), InteractionLog::new(db)))
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("Chosen".parse::<InteractionAction>().unwrap(), InteractionAction::Chosen);
        assert!("liked".parse::<InteractionAction>().is_err());
    }

    #[test]
    fn test_record_and_list() -> Result<()> {
        let (repo, log) = setup()?;
        let prompt = repo.create(&NewPrompt::new("offer", Phase::Solutio, "openai", "gpt-4o"))?;
        let session = Uuid::new_v4();
        let before = Utc::now() - chrono::Duration::seconds(1);

        let chosen = log.record(&NewInteraction::new(prompt, session, InteractionAction::Chosen))?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let rated = log.record(
            &NewInteraction::new(prompt, session, InteractionAction::Rated).with_score(0.8),
        )?;

        let listed = log.list_since(before, 0)?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, rated.id);
        assert_eq!(listed[0].score, 0.8);
        assert_eq!(listed[1], chosen);

        let later = log.list_since(rated.recorded_at, 10)?;
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, rated.id);

        assert_eq!(log.for_prompt(&prompt)?.len(), 2);
        assert_eq!(log.count()?, 2);
        Ok(())
    }

    #[test]
    fn test_record_rejects_bad_input() -> Result<()> {
        let (repo, log) = setup()?;
        let prompt = repo.create(&NewPrompt::new("offer", Phase::Solutio, "openai", "gpt-4o"))?;

        let err = log
            .record(&NewInteraction::new(Uuid::new_v4(), Uuid::new_v4(), InteractionAction::Skipped))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = log
            .record(
                &NewInteraction::new(prompt, Uuid::new_v4(), InteractionAction::Rated)
                    .with_score(1.5),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(log.count()?, 0);
        Ok(())
    }

    #[test]
    fn test_delete_prompt_removes_interactions() -> Result<()> {
        let (repo, log) = setup()?;
        let gone = repo.create(&NewPrompt::new("gone", Phase::Solutio, "openai", "gpt-4o"))?;
        let kept = repo.create(&NewPrompt::new("kept", Phase::Solutio, "openai", "gpt-4o"))?;
        let session = Uuid::new_v4();
        log.record(&NewInteraction::new(gone, session, InteractionAction::Skipped))?;
        log.record(&NewInteraction::new(kept, session, InteractionAction::Chosen))?;

        repo.delete(&gone)?;

        assert!(log.for_prompt(&gone)?.is_empty());
        assert_eq!(log.for_prompt(&kept)?.len(), 1);
        assert_eq!(log.count()?, 1);
        Ok(())
    }
}
