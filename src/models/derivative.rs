//! Represents a cached image-transform output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A generated, cached alternate rendition of an image file version.
///
/// Unique per `(file_version_id, transform_key)`. The output bytes live in
/// the content store under `content_hash`; this row is only metadata.
/// `accessed_at` is bumped on every cache hit and drives TTL eviction.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Derivative {
    /// Unique identifier; also the tail of the derivative's object key.
    pub id: Uuid,

    /// Owning file. Not enforced by the schema so permanently deleted files
    /// can leave orphans for the sweeper.
    pub file_id: Uuid,

    /// The exact version snapshot this derivative was rendered from.
    pub file_version_id: Uuid,

    /// Deterministic digest of the normalized transform parameters.
    pub transform_key: String,

    /// SHA-256 hash addressing the output blob.
    pub content_hash: String,

    /// MIME type of the output encoding.
    pub mime: String,

    /// Output width in pixels.
    pub width: i64,

    /// Output height in pixels.
    pub height: i64,

    /// Output size in bytes.
    pub size: i64,

    /// When the derivative was generated.
    pub created_at: DateTime<Utc>,

    /// Last cache hit; drives age-based eviction.
    pub accessed_at: DateTime<Utc>,
}

impl Derivative {
    /// Object key under which the derivative is addressable in URLs.
    pub fn object_key(&self) -> String {
        format!("d/{}", self.id)
    }
}
