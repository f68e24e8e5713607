//! Represents an ephemeral upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An upload-intent record, created before any bytes arrive.
///
/// Consumed exactly once on completion or cancellation; anything past
/// `expires_at` is rejected at access time and eventually garbage.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Unique identifier, handed to the client as the upload handle.
    pub id: Uuid,

    /// Target bucket.
    pub bucket_id: Uuid,

    /// Uploading user.
    pub user_id: Uuid,

    /// Declared filename.
    pub filename: String,

    /// Declared MIME type, validated against the bucket's allow-list.
    pub mime: String,

    /// Declared size in bytes, validated against the configured cap.
    pub declared_size: i64,

    /// Object key reserved for the file if this upload creates one.
    pub object_key: String,

    /// Hard deadline for completing the upload.
    pub expires_at: DateTime<Utc>,

    /// Set when the session has been consumed (completed or cancelled).
    pub completed: bool,

    /// When the session was opened.
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
