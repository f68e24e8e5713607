//! Soft-delete / restore / permanent-delete state machine.
//!
//! A trashed file keeps all of its rows and content; it is merely hidden
//! from active listings and excluded from the bucket's counters. Restore is
//! legal only inside the retention window. Permanent delete walks every
//! version and derivative, releases each distinct blob through the content
//! store's reference check, and tolerates hashes a sibling delete already
//! removed. Expiry is a derived property; the sweeper is what actually
//! turns expired trash into permanent deletion.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::file::File;
use crate::services::content_store::{ContentStore, StoreError};

/// Default retention window for trashed files.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum TrashError {
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("file `{0}` is not in the trash")]
    NotTrashed(Uuid),
    #[error("restore window expired at {expired_at}")]
    RestoreWindowExpired { expired_at: DateTime<Utc> },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type TrashResult<T> = Result<T, TrashError>;

/// A trash listing entry; `expired` and `restore_until` are derived from
/// `deleted_at` at read time, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TrashEntry {
    #[serde(flatten)]
    pub file: File,
    pub restore_until: DateTime<Utc>,
    pub expired: bool,
}

#[derive(Clone)]
pub struct TrashService {
    db: Arc<SqlitePool>,
    store: ContentStore,
    retention: Duration,
}

impl TrashService {
    pub fn new(db: Arc<SqlitePool>, store: ContentStore, retention_days: i64) -> Self {
        Self {
            db,
            store,
            retention: Duration::days(retention_days),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    async fn fetch_file(&self, file_id: Uuid) -> TrashResult<File> {
        sqlx::query_as::<_, File>(
            "SELECT id, bucket_id, user_id, name, object_key, mime, size, content_hash,
                    is_public, current_version_id, created_at, deleted_at
             FROM files WHERE id = ?",
        )
        .bind(file_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => TrashError::FileNotFound(file_id),
            other => TrashError::Sqlx(other),
        })
    }

    /// Sum of all version snapshot sizes for a file; the amount the bucket
    /// counter moves by when the file enters or leaves the trash.
    async fn versioned_size(&self, file_id: Uuid) -> TrashResult<i64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM file_versions WHERE file_id = ?")
                .bind(file_id)
                .fetch_one(&*self.db)
                .await?;
        Ok(total)
    }

    /// `Active -> Trashed`. Idempotent: re-deleting a trashed file keeps the
    /// original `deleted_at` (and the original restore window).
    pub async fn soft_delete(&self, file_id: Uuid) -> TrashResult<File> {
        let file = self.fetch_file(file_id).await?;
        if file.is_trashed() {
            return Ok(file);
        }

        let size = self.versioned_size(file_id).await?;
        let mut tx = self.db.begin().await?;
        let marked = sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now())
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        // A concurrent delete may have flipped the row between the fetch and
        // here; the counters move only for the call that actually flipped it.
        if marked.rows_affected() == 1 {
            sqlx::query(
                "UPDATE buckets SET file_count = file_count - 1, storage_used = storage_used - ?
                 WHERE id = ?",
            )
            .bind(size)
            .bind(file.bucket_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(%file_id, "soft-deleted file");
        self.fetch_file(file_id).await
    }

    /// `Trashed -> Restored`, legal only inside the retention window.
    pub async fn restore(&self, file_id: Uuid) -> TrashResult<File> {
        let file = self.fetch_file(file_id).await?;
        let Some(deleted_at) = file.deleted_at else {
            return Err(TrashError::NotTrashed(file_id));
        };

        let expires_at = deleted_at + self.retention;
        if Utc::now() > expires_at {
            return Err(TrashError::RestoreWindowExpired {
                expired_at: expires_at,
            });
        }

        let size = self.versioned_size(file_id).await?;
        let mut tx = self.db.begin().await?;
        let cleared =
            sqlx::query("UPDATE files SET deleted_at = NULL WHERE id = ? AND deleted_at IS NOT NULL")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        // Same guard as soft_delete: a concurrent restore that won the race
        // already moved the counters.
        if cleared.rows_affected() == 1 {
            sqlx::query(
                "UPDATE buckets SET file_count = file_count + 1, storage_used = storage_used + ?
                 WHERE id = ?",
            )
            .bind(size)
            .bind(file.bucket_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(%file_id, "restored file from trash");
        self.fetch_file(file_id).await
    }

    /// Remove a file and everything hanging off it, for good.
    ///
    /// Works on active files (bypassing the trash) as well as trashed ones,
    /// and is idempotent: a file already gone is a soft success, as is any
    /// blob a concurrent delete of a content-sharing sibling removed first.
    pub async fn permanent_delete(&self, file_id: Uuid) -> TrashResult<()> {
        let file = match self.fetch_file(file_id).await {
            Ok(file) => file,
            Err(TrashError::FileNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        // Distinct hashes across versions and derivatives; released only
        // after their referencing rows are gone.
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT content_hash FROM file_versions WHERE file_id = ?1
             UNION
             SELECT DISTINCT content_hash FROM derivatives WHERE file_id = ?1",
        )
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?;

        let counted_size = if file.is_trashed() {
            0
        } else {
            self.versioned_size(file_id).await?
        };

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM derivatives WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        if counted_size > 0 || !file.is_trashed() {
            sqlx::query(
                "UPDATE buckets SET file_count = file_count - 1, storage_used = storage_used - ?
                 WHERE id = ?",
            )
            .bind(counted_size)
            .bind(file.bucket_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for hash in hashes {
            match self.store.delete(&hash).await {
                Ok(true) => {}
                Ok(false) => debug!(%hash, "blob shared with another file, kept"),
                Err(StoreError::BlobNotFound(_)) => {
                    debug!(%hash, "blob already removed by a sibling delete");
                }
                Err(err) => warn!(%hash, "failed to release blob: {err}"),
            }
        }

        debug!(%file_id, "permanently deleted file");
        Ok(())
    }

    /// Trashed files for one user, newest deletion first, with the derived
    /// expiry flag the UI shows.
    pub async fn list_trash(&self, user_id: Uuid) -> TrashResult<Vec<TrashEntry>> {
        let files = sqlx::query_as::<_, File>(
            "SELECT id, bucket_id, user_id, name, object_key, mime, size, content_hash,
                    is_public, current_version_id, created_at, deleted_at
             FROM files WHERE user_id = ? AND deleted_at IS NOT NULL
             ORDER BY deleted_at DESC",
        )
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?;

        let now = Utc::now();
        Ok(files
            .into_iter()
            .filter_map(|file| {
                let deleted_at = file.deleted_at?;
                let restore_until = deleted_at + self.retention;
                Some(TrashEntry {
                    expired: now > restore_until,
                    restore_until,
                    file,
                })
            })
            .collect())
    }

    /// Files whose retention window has passed, oldest first; the sweeper's
    /// work queue for automatic purging.
    pub async fn list_expired(&self, limit: i64) -> TrashResult<Vec<Uuid>> {
        let cutoff = Utc::now() - self.retention;
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM files WHERE deleted_at IS NOT NULL AND deleted_at < ?
             ORDER BY deleted_at ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }
}
