//! Batch eviction sweeper.
//!
//! Repeatable, idempotent job with three policies run in sequence, each
//! bounded to a fixed batch size per pass: age-based derivative eviction,
//! orphan-based derivative eviction, and expired-trash purging. Individual
//! item failures are counted but never abort a batch.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::content_store::{ContentStore, StoreError};
use crate::services::trash_service::{TrashError, TrashService};

/// Derivatives unused for this long are reclaimed.
pub const MAX_DERIVATIVE_AGE_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trash(#[from] TrashError),
}

/// Outcome of one policy pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PolicyReport {
    pub cleaned: u64,
    pub errors: u64,
}

/// Point-in-time snapshot of the derivative cache.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub total_count: i64,
    pub total_size: i64,
    pub older_than_30d: i64,
    pub accessed_within_24h: i64,
}

/// Full sweep outcome: per-policy counts bracketed by cache snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub before: CacheStats,
    pub aged: PolicyReport,
    pub orphaned: PolicyReport,
    pub expired_trash: PolicyReport,
    pub after: CacheStats,
}

#[derive(Clone)]
pub struct Sweeper {
    db: Arc<SqlitePool>,
    store: ContentStore,
    trash: TrashService,
    batch_size: i64,
    max_age: Duration,
}

impl Sweeper {
    pub fn new(
        db: Arc<SqlitePool>,
        store: ContentStore,
        trash: TrashService,
        batch_size: i64,
    ) -> Self {
        Self {
            db,
            store,
            trash,
            batch_size: batch_size.max(1),
            max_age: Duration::days(MAX_DERIVATIVE_AGE_DAYS),
        }
    }

    /// Run every policy once and report.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let before = self.stats().await?;
        let aged = self.sweep_aged().await?;
        let orphaned = self.sweep_orphans().await?;
        let expired_trash = self.sweep_expired_trash().await?;
        let after = self.stats().await?;

        info!(
            aged_cleaned = aged.cleaned,
            orphaned_cleaned = orphaned.cleaned,
            trash_purged = expired_trash.cleaned,
            errors = aged.errors + orphaned.errors + expired_trash.errors,
            "sweep complete"
        );

        Ok(SweepReport {
            before,
            aged,
            orphaned,
            expired_trash,
            after,
        })
    }

    pub async fn stats(&self) -> Result<CacheStats, SweepError> {
        let age_cutoff = Utc::now() - self.max_age;
        let recent_cutoff = Utc::now() - Duration::hours(24);

        let (total_count, total_size): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM derivatives",
        )
        .fetch_one(&*self.db)
        .await?;
        let older_than_30d: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM derivatives WHERE accessed_at < ?")
                .bind(age_cutoff)
                .fetch_one(&*self.db)
                .await?;
        let accessed_within_24h: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM derivatives WHERE accessed_at >= ?")
                .bind(recent_cutoff)
                .fetch_one(&*self.db)
                .await?;

        Ok(CacheStats {
            total_count,
            total_size,
            older_than_30d,
            accessed_within_24h,
        })
    }

    /// Age-based pass: least-recently-accessed derivatives past the TTL.
    async fn sweep_aged(&self) -> Result<PolicyReport, SweepError> {
        let cutoff = Utc::now() - self.max_age;
        let victims: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT id, content_hash FROM derivatives
             WHERE accessed_at < ? ORDER BY accessed_at ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(self.batch_size)
        .fetch_all(&*self.db)
        .await?;

        Ok(self.evict(victims).await)
    }

    /// Orphan pass: derivatives whose file is missing or soft-deleted,
    /// regardless of how recently they were accessed.
    async fn sweep_orphans(&self) -> Result<PolicyReport, SweepError> {
        let victims: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT d.id, d.content_hash FROM derivatives d
             LEFT JOIN files f ON f.id = d.file_id
             WHERE f.id IS NULL OR f.deleted_at IS NOT NULL
             LIMIT ?",
        )
        .bind(self.batch_size)
        .fetch_all(&*self.db)
        .await?;

        Ok(self.evict(victims).await)
    }

    /// Delete derivative rows then release their blobs. A blob that is
    /// still shared, or already gone, is not an error; anything else is
    /// counted and the batch continues.
    async fn evict(&self, victims: Vec<(Uuid, String)>) -> PolicyReport {
        let mut report = PolicyReport::default();
        for (id, hash) in victims {
            let removed = sqlx::query("DELETE FROM derivatives WHERE id = ?")
                .bind(id)
                .execute(&*self.db)
                .await;
            match removed {
                Ok(_) => {}
                Err(err) => {
                    warn!(derivative = %id, "failed to delete derivative row: {err}");
                    report.errors += 1;
                    continue;
                }
            }
            match self.store.delete(&hash).await {
                Ok(_) => report.cleaned += 1,
                Err(StoreError::BlobNotFound(_)) => report.cleaned += 1,
                Err(err) => {
                    warn!(%hash, "failed to release derivative blob: {err}");
                    report.errors += 1;
                }
            }
        }
        report
    }

    /// Expired-trash pass: files whose retention window has lapsed are
    /// permanently deleted; without this they would linger indefinitely.
    async fn sweep_expired_trash(&self) -> Result<PolicyReport, SweepError> {
        let mut report = PolicyReport::default();
        let expired = self.trash.list_expired(self.batch_size).await?;

        for file_id in expired {
            match self.trash.permanent_delete(file_id).await {
                Ok(()) => report.cleaned += 1,
                Err(err) => {
                    warn!(%file_id, "failed to purge expired file: {err}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}
