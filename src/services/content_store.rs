//! Content-addressable blob store.
//!
//! Maps SHA-256 content hashes to immutable byte blobs. Metadata (one row
//! per distinct hash) lives in SQLite; payloads live on disk, sharded
//! beneath `base_path/objects/{hh}/{hh}/{hash}` so no directory collects an
//! unbounded number of entries. Identical content is stored exactly once,
//! and a blob is never deleted while any file version or derivative still
//! references its hash.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content blob `{0}` not found")]
    BlobNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata row for a stored blob.
#[derive(Debug, Clone, FromRow)]
pub struct ContentBlob {
    pub hash: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// Compute the lowercase hex SHA-256 digest of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content store handle; cheap to clone and share across request handlers.
#[derive(Clone)]
pub struct ContentStore {
    db: Arc<SqlitePool>,
    base_path: PathBuf,
}

impl ContentStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Root directory holding all blob shards.
    pub fn objects_root(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Physical path for a hash: `objects/{hash[0..2]}/{hash[2..4]}/{hash}`.
    fn blob_path(&self, hash: &str) -> PathBuf {
        let mut path = self.objects_root();
        path.push(&hash[..2]);
        path.push(&hash[2..4]);
        path.push(hash);
        path
    }

    /// Persist a byte buffer, deduplicating by content hash.
    ///
    /// The row insert uses `INSERT OR IGNORE` so concurrent puts of
    /// identical bytes race harmlessly: both writers hash to the same key,
    /// both temp files rename onto the same final path, and exactly one row
    /// survives. Never reads-then-writes.
    pub async fn put(&self, bytes: &[u8]) -> StoreResult<ContentBlob> {
        let hash = content_hash(bytes);
        let size = bytes.len() as i64;
        let path = self.blob_path(&hash);

        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        // Write to a temp file and rename into place; rename onto an
        // existing identical blob is a no-op in effect.
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let created_at = Utc::now();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO content_blobs (hash, size, created_at) VALUES (?, ?, ?)",
        )
        .bind(&hash)
        .bind(size)
        .bind(created_at)
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!(%hash, size, "stored new content blob");
        } else {
            debug!(%hash, "deduplicated content blob");
        }

        Ok(ContentBlob {
            hash,
            size,
            created_at,
        })
    }

    /// Fetch blob metadata. `BlobNotFound` if the hash is unknown.
    pub async fn stat(&self, hash: &str) -> StoreResult<ContentBlob> {
        sqlx::query_as::<_, ContentBlob>(
            "SELECT hash, size, created_at FROM content_blobs WHERE hash = ?",
        )
        .bind(hash)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::BlobNotFound(hash.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    /// Read a whole blob into memory.
    pub async fn get(&self, hash: &str) -> StoreResult<Vec<u8>> {
        ensure_hash_shape(hash)?;
        match fs::read(self.blob_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(hash.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Open a blob for streaming out, returning its metadata alongside.
    pub async fn reader(&self, hash: &str) -> StoreResult<(ContentBlob, File)> {
        ensure_hash_shape(hash)?;
        let blob = self.stat(hash).await?;
        let file = File::open(self.blob_path(hash)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::BlobNotFound(hash.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok((blob, file))
    }

    /// Count live references to a hash across versions and derivatives.
    pub async fn reference_count(&self, hash: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM file_versions WHERE content_hash = ?1)
                  + (SELECT COUNT(*) FROM derivatives WHERE content_hash = ?1)",
        )
        .bind(hash)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Reference-checked delete.
    ///
    /// Returns `Ok(false)` without touching anything while any file version
    /// or derivative still references the hash. A missing payload file is
    /// tolerated (a sibling delete may already have removed it).
    pub async fn delete(&self, hash: &str) -> StoreResult<bool> {
        ensure_hash_shape(hash)?;
        if self.reference_count(hash).await? > 0 {
            debug!(%hash, "blob still referenced, skipping delete");
            return Ok(false);
        }

        sqlx::query("DELETE FROM content_blobs WHERE hash = ?")
            .bind(hash)
            .execute(&*self.db)
            .await?;

        let path = self.blob_path(hash);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(%hash, "removed blob payload"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(%hash, "blob payload already missing");
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            let root = self.objects_root();
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(true)
    }

    /// Recursively remove empty shard directories up to the objects root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(()) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Guard against hashes too short to shard (and trivially malformed input
/// reaching the filesystem layer).
fn ensure_hash_shape(hash: &str) -> StoreResult<()> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::BlobNotFound(hash.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let h = content_hash(b"hello world");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash(b"hello world"));
        assert_ne!(h, content_hash(b"hello worlds"));
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(ensure_hash_shape("abc").is_err());
        assert!(ensure_hash_shape(&"g".repeat(64)).is_err());
        assert!(ensure_hash_shape(&"a".repeat(64)).is_ok());
    }
}
