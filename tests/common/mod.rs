//! Shared test harness: an in-memory database with the real schema, a
//! temp-dir blob store, and the service stack wired the same way the server
//! wires it.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::TempDir;
use uuid::Uuid;

use filevault::models::file::{File, FileVersion};
use filevault::services::{
    content_store::ContentStore, sweeper::Sweeper, transform_service::TransformService,
    trash_service::TrashService, upload_service::UploadService, version_service::VersionService,
};

pub const RETENTION_DAYS: i64 = 7;
pub const MAX_UPLOAD_BYTES: i64 = 10 * 1024 * 1024;

pub struct TestEnv {
    pub db: Arc<SqlitePool>,
    pub store: ContentStore,
    pub versions: VersionService,
    pub trash: TrashService,
    pub uploads: UploadService,
    pub transforms: TransformService,
    pub sweeper: Sweeper,
    // Held so the blob directory outlives the services using it.
    _blobs: TempDir,
}

pub async fn test_env() -> TestEnv {
    // A single connection keeps every query on the same in-memory database.
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database"),
    );
    filevault::run_migrations(&db).await.expect("apply schema");

    let blobs = TempDir::new().expect("create blob tempdir");
    let store = ContentStore::new(db.clone(), blobs.path());
    let versions = VersionService::new(db.clone(), store.clone());
    let trash = TrashService::new(db.clone(), store.clone(), RETENTION_DAYS);
    let uploads = UploadService::new(db.clone(), MAX_UPLOAD_BYTES);
    let transforms = TransformService::new(
        db.clone(),
        store.clone(),
        2,
        StdDuration::from_secs(30),
    );
    let sweeper = Sweeper::new(db.clone(), store.clone(), trash.clone(), 100);

    TestEnv {
        db,
        store,
        versions,
        trash,
        uploads,
        transforms,
        sweeper,
        _blobs: blobs,
    }
}

/// Insert a bucket row directly and return its ID.
pub async fn seed_bucket(
    db: &SqlitePool,
    owner_id: Uuid,
    versioning_enabled: bool,
    allowed_mime: Option<&str>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO buckets (id, owner_id, name, slug, is_public, versioning_enabled,
                              allowed_mime, file_count, storage_used, created_at)
         VALUES (?, ?, ?, ?, 0, ?, ?, 0, 0, ?)",
    )
    .bind(id)
    .bind(owner_id)
    .bind("test bucket")
    .bind(format!("b-{}", Uuid::new_v4()))
    .bind(versioning_enabled)
    .bind(allowed_mime)
    .bind(Utc::now())
    .execute(db)
    .await
    .expect("seed bucket");
    id
}

/// Shorthand for committing bytes as a named file in a bucket.
pub async fn upload(
    env: &TestEnv,
    bucket_id: Uuid,
    user_id: Uuid,
    name: &str,
    mime: &str,
    bytes: &[u8],
) -> (File, FileVersion) {
    let object_key = format!("test/{}/{}", Uuid::new_v4(), name);
    env.versions
        .ingest(bucket_id, user_id, name, &object_key, mime, bytes)
        .await
        .expect("ingest upload")
}

pub async fn bucket_counters(db: &SqlitePool, bucket_id: Uuid) -> (i64, i64) {
    sqlx::query_as("SELECT file_count, storage_used FROM buckets WHERE id = ?")
        .bind(bucket_id)
        .fetch_one(db)
        .await
        .expect("fetch bucket counters")
}

/// Rewrite `deleted_at` so retention-window behavior can be tested without
/// waiting.
pub async fn backdate_deletion(db: &SqlitePool, file_id: Uuid, ago: Duration) {
    sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ?")
        .bind(Utc::now() - ago)
        .bind(file_id)
        .execute(db)
        .await
        .expect("backdate deletion");
}

/// Rewrite a derivative's `accessed_at` to simulate age.
pub async fn backdate_access(db: &SqlitePool, derivative_id: Uuid, ago: Duration) {
    sqlx::query("UPDATE derivatives SET accessed_at = ? WHERE id = ?")
        .bind(Utc::now() - ago)
        .bind(derivative_id)
        .execute(db)
        .await
        .expect("backdate access");
}

pub async fn derivative_count(db: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM derivatives")
        .fetch_one(db)
        .await
        .expect("count derivatives")
}

pub async fn accessed_at(db: &SqlitePool, derivative_id: Uuid) -> DateTime<Utc> {
    sqlx::query_scalar("SELECT accessed_at FROM derivatives WHERE id = ?")
        .bind(derivative_id)
        .fetch_one(db)
        .await
        .expect("fetch accessed_at")
}

/// A small solid-color PNG for transform tests.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([200, 60, 20, 255]),
    ));
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("encode test png");
    out
}
