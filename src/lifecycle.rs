//! Lifecycle maintenance: relevance decay and capacity-bounded cleanup
//!
//! Relevance combines recency and usage:
//!
//! ```text
//! score = w * 0.5^(age_days / half_life) + (1 - w) * usage / (usage + saturation)
//! ```
//!
//! clamped to [0, 1]. Older records score lower and more-used records score
//! higher, all else equal. Every constant is read from the Config Store.
//!
//! Cleanup evicts the lowest-relevance records (oldest first on ties) until
//! the store is back under `max_prompts`, and never touches a record at or
//! above the protect threshold.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::SqliteDatabase;
use crate::error::{Result, StoreError};
use crate::settings::{keys, ConfigStore};
use crate::storage::prompts::delete_prompt;
use crate::storage::types::{from_millis, to_millis};

pub const DEFAULT_MAX_PROMPTS: u64 = 1000;
pub const DEFAULT_MIN_RELEVANCE_SCORE: f64 = 0.3;
pub const DEFAULT_PROTECT_RELEVANCE_SCORE: f64 = 0.9;
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 30.0;
pub const DEFAULT_USAGE_SATURATION: f64 = 5.0;
pub const DEFAULT_RECENCY_WEIGHT: f64 = 0.7;

/// Rows rescored per batch
const RESCORE_BATCH_SIZE: i64 = 500;

/// Rows evicted per delete round
const EVICTION_CHUNK_SIZE: u64 = 500;

/// Scores closer than this are treated as unchanged
const SCORE_EPSILON: f64 = 1e-9;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

// =============================================================================
// Relevance policy
// =============================================================================

/// Constants of the relevance decay curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevancePolicy {
    /// Days for the recency term to halve
    pub half_life_days: f64,
    /// Usage count at which the usage term reaches 0.5
    pub usage_saturation: f64,
    /// Weight of recency vs usage, strictly between 0 and 1
    pub recency_weight: f64,
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self {
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            usage_saturation: DEFAULT_USAGE_SATURATION,
            recency_weight: DEFAULT_RECENCY_WEIGHT,
        }
    }
}

impl RelevancePolicy {
    /// Read the policy from the Config Store, replacing invalid values with defaults
    pub fn load(config: &ConfigStore) -> Result<Self> {
        let defaults = Self::default();

        let half_life_days = positive_or(
            keys::RELEVANCE_HALF_LIFE_DAYS,
            config.get_float(keys::RELEVANCE_HALF_LIFE_DAYS, defaults.half_life_days)?,
            defaults.half_life_days,
        );
        let usage_saturation = positive_or(
            keys::RELEVANCE_USAGE_SATURATION,
            config.get_float(keys::RELEVANCE_USAGE_SATURATION, defaults.usage_saturation)?,
            defaults.usage_saturation,
        );
        let weight = config.get_float(keys::RELEVANCE_RECENCY_WEIGHT, defaults.recency_weight)?;
        // both terms must carry weight for the score to move with age and usage
        let recency_weight = if weight > 0.0 && weight < 1.0 {
            weight
        } else {
            tracing::warn!(key = keys::RELEVANCE_RECENCY_WEIGHT, value = weight, "out of range, using default");
            defaults.recency_weight
        };

        Ok(Self {
            half_life_days,
            usage_saturation,
            recency_weight,
        })
    }

    /// Relevance for a record of the given age and usage, in [0, 1]
    pub fn score(&self, age: Duration, usage_count: u64) -> f64 {
        let age_days = age.num_milliseconds().max(0) as f64 / MILLIS_PER_DAY;
        let recency = 0.5f64.powf(age_days / self.half_life_days);
        let usage = usage_count as f64;
        let popularity = usage / (usage + self.usage_saturation);

        let score = self.recency_weight * recency + (1.0 - self.recency_weight) * popularity;
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

fn positive_or(key: &str, value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        tracing::warn!(key, value, "non-positive setting, using default");
        default
    }
}

// =============================================================================
// Cleanup policy
// =============================================================================

/// Thresholds driving cleanup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub max_prompts: u64,
    pub min_relevance_score: f64,
    pub protect_relevance_score: f64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_prompts: DEFAULT_MAX_PROMPTS,
            min_relevance_score: DEFAULT_MIN_RELEVANCE_SCORE,
            protect_relevance_score: DEFAULT_PROTECT_RELEVANCE_SCORE,
        }
    }
}

impl CleanupPolicy {
    pub fn load(config: &ConfigStore) -> Result<Self> {
        let max_prompts = match config.get_int(keys::MAX_PROMPTS, DEFAULT_MAX_PROMPTS as i64)? {
            n if n >= 0 => n as u64,
            n => {
                tracing::warn!(key = keys::MAX_PROMPTS, value = n, "negative setting, using default");
                DEFAULT_MAX_PROMPTS
            }
        };

        Ok(Self {
            max_prompts,
            min_relevance_score: config
                .get_float(keys::MIN_RELEVANCE_SCORE, DEFAULT_MIN_RELEVANCE_SCORE)?,
            protect_relevance_score: config
                .get_float(keys::PROTECT_RELEVANCE_SCORE, DEFAULT_PROTECT_RELEVANCE_SCORE)?,
        })
    }

    /// Records scoring at or above this are never evicted
    pub fn protect_threshold(&self) -> f64 {
        self.protect_relevance_score.max(self.min_relevance_score)
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelevanceReport {
    pub scanned: usize,
    pub updated: usize,
    pub batches: usize,
}

/// Outcome of a cleanup run (or what a dry run would have done)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub current_count: u64,
    pub max_prompts: u64,
    pub min_relevance_score: f64,
    pub protect_threshold: f64,
    pub deleted: u64,
    /// Excess records that could not be evicted because they are protected
    pub skipped_protected: u64,
    pub remaining: u64,
}

/// Which maintenance steps to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceOptions {
    pub update_relevance: bool,
    pub cleanup: bool,
    pub dry_run: bool,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            update_relevance: true,
            cleanup: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub dry_run: bool,
    pub relevance: Option<RelevanceReport>,
    pub cleanup: Option<CleanupReport>,
}

// =============================================================================
// Transaction bodies
// =============================================================================

struct RescoreBatch {
    scanned: usize,
    updated: usize,
    last_id: Option<String>,
}

/// Rescore up to one batch of records with id greater than `after`
fn rescore_batch(
    conn: &Connection,
    policy: &RelevancePolicy,
    now: DateTime<Utc>,
    after: &str,
) -> Result<RescoreBatch> {
    let mut select = conn.prepare_cached(
        "SELECT id, relevance_score, usage_count, created_at FROM prompts
         WHERE id > ?1 ORDER BY id LIMIT ?2",
    )?;
    let rows = select
        .query_map(params![after, RESCORE_BATCH_SIZE], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut update = conn.prepare_cached(
        "UPDATE prompts SET relevance_score = ?2, updated_at = MAX(?3, updated_at + 1)
         WHERE id = ?1",
    )?;
    let now_ms = to_millis(now);
    let mut updated = 0;

    for (id, current, usage_count, created_at) in &rows {
        let age = now - from_millis(*created_at)?;
        let score = policy.score(age, *usage_count);
        if (score - current).abs() > SCORE_EPSILON {
            update.execute(params![id, score, now_ms])?;
            updated += 1;
        }
    }

    Ok(RescoreBatch {
        scanned: rows.len(),
        updated,
        last_id: rows.last().map(|(id, ..)| id.clone()),
    })
}

/// Rescore every record inside one transaction
fn rescore_all(
    conn: &Connection,
    policy: &RelevancePolicy,
    now: DateTime<Utc>,
) -> Result<RelevanceReport> {
    let mut report = RelevanceReport::default();
    let mut cursor = String::new();

    loop {
        let batch = rescore_batch(conn, policy, now, &cursor)?;
        report.scanned += batch.scanned;
        report.updated += batch.updated;
        report.batches += 1;
        match batch.last_id {
            Some(last) if batch.scanned as i64 == RESCORE_BATCH_SIZE => cursor = last,
            _ => break,
        }
    }

    Ok(report)
}

/// Evict records until the store fits under the ceiling
fn evict(conn: &Connection, policy: &CleanupPolicy, dry_run: bool) -> Result<CleanupReport> {
    let current_count: u64 = conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))?;
    let protect_threshold = policy.protect_threshold();
    let excess = current_count.saturating_sub(policy.max_prompts);
    let mut deleted = 0u64;

    while deleted < excess {
        let chunk = (excess - deleted).min(EVICTION_CHUNK_SIZE);
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM prompts WHERE relevance_score < ?1
             ORDER BY relevance_score ASC, created_at ASC, id ASC LIMIT ?2",
        )?;
        let victims = stmt
            .query_map(params![protect_threshold, chunk as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if victims.is_empty() {
            break;
        }

        for raw in &victims {
            let id = Uuid::parse_str(raw)
                .map_err(|e| StoreError::Serialization(format!("prompt id '{}': {}", raw, e)))?;
            if delete_prompt(conn, &id)? {
                deleted += 1;
            }
        }
    }

    Ok(CleanupReport {
        dry_run,
        current_count,
        max_prompts: policy.max_prompts,
        min_relevance_score: policy.min_relevance_score,
        protect_threshold,
        deleted,
        skipped_protected: excess - deleted,
        remaining: current_count - deleted,
    })
}

fn maintain(
    conn: &Connection,
    options: &MaintenanceOptions,
    relevance_policy: &RelevancePolicy,
    cleanup_policy: &CleanupPolicy,
    now: DateTime<Utc>,
) -> Result<MaintenanceReport> {
    let relevance = options
        .update_relevance
        .then(|| rescore_all(conn, relevance_policy, now))
        .transpose()?;
    let cleanup = options
        .cleanup
        .then(|| evict(conn, cleanup_policy, options.dry_run))
        .transpose()?;

    Ok(MaintenanceReport {
        dry_run: options.dry_run,
        relevance,
        cleanup,
    })
}

// =============================================================================
// Manager
// =============================================================================

/// Runs relevance decay and cleanup on demand
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    db: Arc<SqliteDatabase>,
    config: ConfigStore,
}

impl LifecycleManager {
    pub fn new(db: Arc<SqliteDatabase>, config: ConfigStore) -> Self {
        Self { db, config }
    }

    /// Recompute every record's relevance as of now
    pub fn update_relevance_scores(&self) -> Result<RelevanceReport> {
        self.update_relevance_scores_at(Utc::now())
    }

    /// Recompute every record's relevance as of `now`
    ///
    /// Each batch commits on its own, so an interrupted run leaves earlier
    /// batches rescored and a rerun finishes the rest.
    pub fn update_relevance_scores_at(&self, now: DateTime<Utc>) -> Result<RelevanceReport> {
        let policy = RelevancePolicy::load(&self.config)?;
        let mut report = RelevanceReport::default();
        let mut cursor = String::new();

        loop {
            let batch = self.db.write(|tx| rescore_batch(tx, &policy, now, &cursor))?;
            report.scanned += batch.scanned;
            report.updated += batch.updated;
            report.batches += 1;
            match batch.last_id {
                Some(last) if batch.scanned as i64 == RESCORE_BATCH_SIZE => cursor = last,
                _ => break,
            }
        }

        tracing::info!(
            scanned = report.scanned,
            updated = report.updated,
            batches = report.batches,
            "updated relevance scores"
        );
        Ok(report)
    }

    /// Evict low-relevance records while over capacity
    ///
    /// With `dry_run` the same eviction runs in a rolled-back transaction and
    /// the report describes what would have been deleted.
    pub fn cleanup_old_prompts(&self, dry_run: bool) -> Result<CleanupReport> {
        let policy = CleanupPolicy::load(&self.config)?;

        let report = if dry_run {
            self.db.rehearse(|tx| evict(tx, &policy, true))?
        } else {
            self.db.write(|tx| evict(tx, &policy, false))?
        };

        tracing::info!(
            dry_run,
            current = report.current_count,
            max_prompts = report.max_prompts,
            deleted = report.deleted,
            skipped_protected = report.skipped_protected,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Relevance update followed by cleanup
    ///
    /// Both steps share one transaction, so cleanup sees the fresh scores and
    /// a failure in either leaves the store unchanged.
    pub fn run_maintenance(&self, options: &MaintenanceOptions) -> Result<MaintenanceReport> {
        self.run_maintenance_at(options, Utc::now())
    }

    pub fn run_maintenance_at(
        &self,
        options: &MaintenanceOptions,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport> {
        let relevance_policy = RelevancePolicy::load(&self.config)?;
        let cleanup_policy = CleanupPolicy::load(&self.config)?;
        let dry_run = options.dry_run;

        let report = if dry_run {
            self.db.rehearse(|tx| {
                maintain(tx, options, &relevance_policy, &cleanup_policy, now)
            })?
        } else {
            self.db.write(|tx| {
                maintain(tx, options, &relevance_policy, &cleanup_policy, now)
            })?
        };

        tracing::info!(
            dry_run,
            rescored = report.relevance.as_ref().map_or(0, |r| r.updated),
            deleted = report.cleanup.as_ref().map_or(0, |c| c.deleted),
            "maintenance finished"
        );
        Ok(report)
    }
}
