//! File versioning state machine.
//!
//! Maintains the append-only chain of version snapshots per file and the
//! single "current" pointer. Every commit is one transaction: insert the
//! new snapshot, flip the current flag, update the file's denormalized
//! fields, adjust the bucket's storage counter. A reader can never observe
//! two current versions or a file pointing at a non-current version.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    bucket::Bucket,
    file::{File, FileVersion},
};
use crate::services::content_store::{ContentStore, StoreError};

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("bucket `{0}` not found")]
    BucketNotFound(Uuid),
    #[error("version `{0}` not found")]
    VersionNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type VersionResult<T> = Result<T, VersionError>;

#[derive(Clone)]
pub struct VersionService {
    db: Arc<SqlitePool>,
    store: ContentStore,
}

const FILE_COLUMNS: &str = "id, bucket_id, user_id, name, object_key, mime, size, content_hash, \
     is_public, current_version_id, created_at, deleted_at";
const VERSION_COLUMNS: &str = "id, file_id, version_no, content_hash, size, mime, \
     restored_from_version, is_current, created_at";

impl VersionService {
    pub fn new(db: Arc<SqlitePool>, store: ContentStore) -> Self {
        Self { db, store }
    }

    /// Fetch a file by ID, trashed or not.
    pub async fn fetch_file(&self, file_id: Uuid) -> VersionResult<File> {
        sqlx::query_as::<_, File>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(file_id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => VersionError::FileNotFound(file_id),
                other => VersionError::Sqlx(other),
            })
    }

    /// Resolve an object key to its file, for the gated read path.
    pub async fn find_by_object_key(&self, object_key: &str) -> VersionResult<Option<File>> {
        let file =
            sqlx::query_as::<_, File>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE object_key = ?"))
                .bind(object_key)
                .fetch_optional(&*self.db)
                .await?;
        Ok(file)
    }

    pub async fn fetch_bucket(&self, bucket_id: Uuid) -> VersionResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT id, owner_id, name, slug, is_public, versioning_enabled, allowed_mime,
                    file_count, storage_used, created_at, deleted_at
             FROM buckets WHERE id = ?",
        )
        .bind(bucket_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => VersionError::BucketNotFound(bucket_id),
            other => VersionError::Sqlx(other),
        })
    }

    pub async fn get_version(&self, version_id: Uuid) -> VersionResult<FileVersion> {
        sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE id = ?"
        ))
        .bind(version_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => VersionError::VersionNotFound(version_id),
            other => VersionError::Sqlx(other),
        })
    }

    pub async fn current_version(&self, file_id: Uuid) -> VersionResult<Option<FileVersion>> {
        let version = sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE file_id = ? AND is_current = 1"
        ))
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(version)
    }

    /// Version history, newest first.
    pub async fn list_versions(&self, file_id: Uuid) -> VersionResult<Vec<FileVersion>> {
        let versions = sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE file_id = ? ORDER BY version_no DESC"
        ))
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(versions)
    }

    /// Entry point for a completed upload: find the active file with this
    /// logical name in the bucket, creating it if absent, then commit the
    /// bytes as its next version.
    pub async fn ingest(
        &self,
        bucket_id: Uuid,
        user_id: Uuid,
        name: &str,
        object_key: &str,
        mime: &str,
        bytes: &[u8],
    ) -> VersionResult<(File, FileVersion)> {
        let bucket = self.fetch_bucket(bucket_id).await?;

        let existing = sqlx::query_as::<_, File>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE bucket_id = ? AND name = ? AND deleted_at IS NULL"
        ))
        .bind(bucket_id)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;

        let file_id = match existing {
            Some(file) => file.id,
            None => {
                let id = Uuid::new_v4();
                let mut tx = self.db.begin().await?;
                sqlx::query(
                    "INSERT INTO files (id, bucket_id, user_id, name, object_key, mime, size,
                                        content_hash, is_public, current_version_id, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?, NULL, ?)",
                )
                .bind(id)
                .bind(bucket_id)
                .bind(user_id)
                .bind(name)
                .bind(object_key)
                .bind(mime)
                .bind(bucket.is_public)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE buckets SET file_count = file_count + 1 WHERE id = ?")
                    .bind(bucket_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                id
            }
        };

        let version = self.commit_version(file_id, bytes, mime).await?;
        let file = self.fetch_file(file_id).await?;
        Ok((file, version))
    }

    /// Commit a byte buffer as the file's new current content.
    ///
    /// With versioning enabled (or for the very first upload) this appends
    /// a snapshot; otherwise the single existing version is overwritten in
    /// place and its old blob released.
    pub async fn commit_version(
        &self,
        file_id: Uuid,
        bytes: &[u8],
        mime: &str,
    ) -> VersionResult<FileVersion> {
        let file = self.fetch_file(file_id).await?;
        let bucket = self.fetch_bucket(file.bucket_id).await?;
        let blob = self.store.put(bytes).await?;

        let current = self.current_version(file_id).await?;
        match current {
            Some(current) if !bucket.versioning_enabled => {
                self.overwrite_in_place(&file, &current, &blob.hash, blob.size, mime)
                    .await
            }
            _ => {
                self.append_version(&file, &blob.hash, blob.size, mime, None)
                    .await
            }
        }
    }

    /// Restore an older version by appending a new snapshot with the same
    /// content. History is never rewritten: restoring v3 from a chain at v7
    /// yields v8.
    pub async fn restore_version(
        &self,
        file_id: Uuid,
        version_id: Uuid,
    ) -> VersionResult<FileVersion> {
        let file = self.fetch_file(file_id).await?;
        let source = self.get_version(version_id).await?;
        if source.file_id != file_id {
            return Err(VersionError::VersionNotFound(version_id));
        }

        self.append_version(
            &file,
            &source.content_hash,
            source.size,
            &source.mime,
            Some(source.version_no),
        )
        .await
    }

    /// One atomic unit: insert snapshot, flip current flags, update the
    /// file's denormalized fields and the bucket's storage counter.
    async fn append_version(
        &self,
        file: &File,
        hash: &str,
        size: i64,
        mime: &str,
        restored_from: Option<i64>,
    ) -> VersionResult<FileVersion> {
        let version_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.db.begin().await?;

        let next_no: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version_no), 0) + 1 FROM file_versions WHERE file_id = ?",
        )
        .bind(file.id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO file_versions (id, file_id, version_no, content_hash, size, mime,
                                        restored_from_version, is_current, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(version_id)
        .bind(file.id)
        .bind(next_no)
        .bind(hash)
        .bind(size)
        .bind(mime)
        .bind(restored_from)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE file_versions SET is_current = 0 WHERE file_id = ? AND is_current = 1")
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE file_versions SET is_current = 1 WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE files SET mime = ?, size = ?, content_hash = ?, current_version_id = ?
             WHERE id = ?",
        )
        .bind(mime)
        .bind(size)
        .bind(hash)
        .bind(version_id)
        .bind(file.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE buckets SET storage_used = storage_used + ? WHERE id = ?")
            .bind(size)
            .bind(file.bucket_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(file_id = %file.id, version_no = next_no, %hash, "committed version");
        self.get_version(version_id).await
    }

    /// Non-versioned buckets: replace the single snapshot's content, then
    /// release the old blob and any derivatives rendered from it.
    async fn overwrite_in_place(
        &self,
        file: &File,
        current: &FileVersion,
        hash: &str,
        size: i64,
        mime: &str,
    ) -> VersionResult<FileVersion> {
        let old_hash = current.content_hash.clone();
        let delta = size - current.size;
        let now = Utc::now();

        let stale_hashes: Vec<String> =
            sqlx::query_scalar("SELECT content_hash FROM derivatives WHERE file_version_id = ?")
                .bind(current.id)
                .fetch_all(&*self.db)
                .await?;

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE file_versions SET content_hash = ?, size = ?, mime = ?, created_at = ?
             WHERE id = ?",
        )
        .bind(hash)
        .bind(size)
        .bind(mime)
        .bind(now)
        .bind(current.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE files SET mime = ?, size = ?, content_hash = ? WHERE id = ?")
            .bind(mime)
            .bind(size)
            .bind(hash)
            .bind(file.id)
            .execute(&mut *tx)
            .await?;

        // Content changed under the same version ID; cached derivatives are
        // stale and must not be served again.
        sqlx::query("DELETE FROM derivatives WHERE file_version_id = ?")
            .bind(current.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE buckets SET storage_used = storage_used + ? WHERE id = ?")
            .bind(delta)
            .bind(file.bucket_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if old_hash != hash {
            if let Err(err) = self.store.delete(&old_hash).await {
                warn!(hash = %old_hash, "failed to release overwritten blob: {err}");
            }
        }
        for stale in stale_hashes {
            if let Err(err) = self.store.delete(&stale).await {
                warn!(hash = %stale, "failed to release stale derivative blob: {err}");
            }
        }

        debug!(file_id = %file.id, %hash, "overwrote single version in place");
        self.get_version(current.id).await
    }
}
