//! Represents a logical bucket — a top-level container for files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket owned by a single user.
///
/// Buckets act as namespaces for files and carry the policy knobs that the
/// core consults: default visibility, whether uploads create new versions or
/// overwrite in place, and which MIME types are accepted. The aggregate
/// counters (`file_count`, `storage_used`) are maintained transactionally by
/// the version and trash services.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// ID of the user that owns this bucket.
    pub owner_id: Uuid,

    /// Display name.
    pub name: String,

    /// URL-safe unique slug, used as the first segment of object keys.
    pub slug: String,

    /// Default visibility for files uploaded into this bucket.
    pub is_public: bool,

    /// When enabled, re-uploads of a logical name append a new version;
    /// otherwise the single version is overwritten in place.
    pub versioning_enabled: bool,

    /// Comma-separated MIME patterns (`image/*,application/pdf`).
    /// `None` accepts anything.
    pub allowed_mime: Option<String>,

    /// Number of active (non-trashed) files.
    pub file_count: i64,

    /// Sum of the sizes of all version snapshots of active files, in bytes.
    pub storage_used: i64,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// Soft-delete marker; hides contained files but deletes nothing.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Bucket {
    /// Check a MIME type against the bucket's allow-list.
    ///
    /// Patterns are matched case-insensitively; a trailing `/*` matches any
    /// subtype (`image/*` accepts `image/png`). An empty or absent list
    /// accepts everything.
    pub fn allows_mime(&self, mime: &str) -> bool {
        let Some(patterns) = self.allowed_mime.as_deref() else {
            return true;
        };
        if patterns.trim().is_empty() {
            return true;
        }
        let mime = mime.to_ascii_lowercase();
        patterns
            .split(',')
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .any(|p| match p.strip_suffix("/*") {
                Some(prefix) => mime
                    .split('/')
                    .next()
                    .is_some_and(|major| major == prefix),
                None => mime == p,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(allowed: Option<&str>) -> Bucket {
        Bucket {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "test".into(),
            slug: "test".into(),
            is_public: false,
            versioning_enabled: true,
            allowed_mime: allowed.map(String::from),
            file_count: 0,
            storage_used: 0,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn absent_list_accepts_everything() {
        assert!(bucket(None).allows_mime("application/x-anything"));
        assert!(bucket(Some("")).allows_mime("video/mp4"));
    }

    #[test]
    fn wildcard_matches_major_type() {
        let b = bucket(Some("image/*"));
        assert!(b.allows_mime("image/png"));
        assert!(b.allows_mime("IMAGE/JPEG"));
        assert!(!b.allows_mime("video/mp4"));
    }

    #[test]
    fn exact_patterns_and_lists() {
        let b = bucket(Some("image/*, application/pdf"));
        assert!(b.allows_mime("application/pdf"));
        assert!(b.allows_mime("image/webp"));
        assert!(!b.allows_mime("application/zip"));
    }
}
