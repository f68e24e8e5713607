//! Upload-session lifecycle.
//!
//! An upload starts as an intent record: declared filename, MIME, and size
//! are validated up front, an object key is reserved, and the session gets
//! a 15 minute deadline. The session is consumed exactly once, on
//! completion or cancellation; expiry is enforced at the moment of access.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{bucket::Bucket, upload_session::UploadSession};

/// How long a session stays completable.
pub const SESSION_TTL_MINUTES: i64 = 15;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(Uuid),
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session belongs to another user")]
    NotSessionOwner,
    #[error("upload session already consumed")]
    SessionConsumed,
    #[error("upload session expired")]
    SessionExpired,
    #[error("MIME type `{0}` is not allowed in this bucket")]
    DisallowedMime(String),
    #[error("declared size {declared} exceeds the {max} byte limit")]
    TooLarge { declared: i64, max: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Clone)]
pub struct UploadService {
    db: Arc<SqlitePool>,
    max_upload_bytes: i64,
}

const SESSION_COLUMNS: &str = "id, bucket_id, user_id, filename, mime, declared_size, \
     object_key, expires_at, completed, created_at";

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, max_upload_bytes: i64) -> Self {
        Self {
            db,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> i64 {
        self.max_upload_bytes
    }

    async fn fetch_bucket(&self, bucket_id: Uuid) -> UploadResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT id, owner_id, name, slug, is_public, versioning_enabled, allowed_mime,
                    file_count, storage_used, created_at, deleted_at
             FROM buckets WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(bucket_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::BucketNotFound(bucket_id),
            other => UploadError::Sqlx(other),
        })
    }

    /// Open an upload intent. Declared MIME and size are validated here so
    /// violations never consume storage.
    pub async fn create_session(
        &self,
        bucket_id: Uuid,
        user_id: Uuid,
        filename: &str,
        mime: &str,
        declared_size: i64,
    ) -> UploadResult<UploadSession> {
        let bucket = self.fetch_bucket(bucket_id).await?;

        if !bucket.allows_mime(mime) {
            return Err(UploadError::DisallowedMime(mime.to_string()));
        }
        if declared_size < 0 || declared_size > self.max_upload_bytes {
            return Err(UploadError::TooLarge {
                declared: declared_size,
                max: self.max_upload_bytes,
            });
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        // Reserved up front; if the name already exists in the bucket the
        // completed upload attaches to that file and this key goes unused.
        let object_key = format!("{}/{}/{}", bucket.slug, Uuid::new_v4(), filename);

        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "INSERT INTO upload_sessions (id, bucket_id, user_id, filename, mime, declared_size,
                                          object_key, expires_at, completed, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .bind(bucket_id)
        .bind(user_id)
        .bind(filename)
        .bind(mime)
        .bind(declared_size)
        .bind(&object_key)
        .bind(now + Duration::minutes(SESSION_TTL_MINUTES))
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        debug!(session = %id, %bucket_id, "opened upload session");
        Ok(session)
    }

    async fn fetch_session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UploadError::SessionNotFound(session_id))
    }

    /// Consume a session exactly once, on behalf of its owner.
    ///
    /// Ownership, consumption, and expiry are all checked before the flag
    /// flips, so a rejected attempt never burns the owner's session. The
    /// conditional UPDATE is the consumption point: only one caller can
    /// flip `completed`, concurrent attempts see `SessionConsumed`.
    pub async fn take_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> UploadResult<UploadSession> {
        let session = self.fetch_session(session_id).await?;

        if session.user_id != user_id {
            return Err(UploadError::NotSessionOwner);
        }
        if session.completed {
            return Err(UploadError::SessionConsumed);
        }
        if session.is_expired(Utc::now()) {
            return Err(UploadError::SessionExpired);
        }

        let claimed = sqlx::query(
            "UPDATE upload_sessions SET completed = 1 WHERE id = ? AND completed = 0",
        )
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        if claimed.rows_affected() == 0 {
            return Err(UploadError::SessionConsumed);
        }

        Ok(session)
    }

    /// Cancel an open session; consuming it without committing anything.
    /// Only the session's owner may cancel it.
    pub async fn cancel_session(&self, session_id: Uuid, user_id: Uuid) -> UploadResult<()> {
        let session = self.fetch_session(session_id).await?;
        if session.user_id != user_id {
            return Err(UploadError::NotSessionOwner);
        }

        let cancelled = sqlx::query(
            "UPDATE upload_sessions SET completed = 1 WHERE id = ? AND completed = 0",
        )
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        if cancelled.rows_affected() == 0 {
            return Err(UploadError::SessionConsumed);
        }
        debug!(session = %session_id, "cancelled upload session");
        Ok(())
    }

    /// Undo a consumption whose follow-up commit failed, so the owner can
    /// retry instead of losing the session to a transient error.
    pub async fn reopen_session(&self, session_id: Uuid) -> UploadResult<()> {
        sqlx::query("UPDATE upload_sessions SET completed = 0 WHERE id = ? AND completed = 1")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        debug!(session = %session_id, "reopened upload session");
        Ok(())
    }
}
