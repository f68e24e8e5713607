//! Represents a logical file and its immutable version snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A logical, possibly-deleted, possibly-multi-version object.
///
/// The MIME/size/hash fields are denormalized from the current version so
/// the read path never needs a join. Invariants maintained by the version
/// service: `current_version_id` always references a version belonging to
/// this file, and that version is the single one flagged current.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct File {
    /// Unique identifier for this file.
    pub id: Uuid,

    /// Owning bucket.
    pub bucket_id: Uuid,

    /// User that created the file.
    pub user_id: Uuid,

    /// Display name, unique per bucket among active files.
    pub name: String,

    /// Logical key used in URLs; distinct from any content hash.
    pub object_key: String,

    /// MIME type of the current version.
    pub mime: String,

    /// Size of the current version in bytes.
    pub size: i64,

    /// Content hash of the current version. `None` only before the first
    /// version is committed.
    pub content_hash: Option<String>,

    /// Whether the file is served without a signature.
    pub is_public: bool,

    /// Pointer to the current `FileVersion`.
    pub current_version_id: Option<Uuid>,

    /// When this file was created.
    pub created_at: DateTime<Utc>,

    /// Soft-delete timestamp; set while the file sits in the trash.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl File {
    pub fn is_trashed(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An immutable snapshot of a file's content at one point in time.
///
/// Version numbers start at 1 and increase monotonically per file; restores
/// append a new version rather than rewriting history.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileVersion {
    /// Unique identifier for this snapshot.
    pub id: Uuid,

    /// Owning file.
    pub file_id: Uuid,

    /// 1-based monotonically increasing version number.
    pub version_no: i64,

    /// SHA-256 hash addressing the content blob.
    pub content_hash: String,

    /// Content size in bytes.
    pub size: i64,

    /// MIME type at the time of this snapshot.
    pub mime: String,

    /// If this version was created by restoring an older one, the version
    /// number it was restored from.
    pub restored_from_version: Option<i64>,

    /// Exactly one version per file carries this flag.
    pub is_current: bool,

    /// When this snapshot was committed.
    pub created_at: DateTime<Utc>,
}
