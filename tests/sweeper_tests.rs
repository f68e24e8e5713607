mod common;

use chrono::Duration;
use common::{backdate_access, backdate_deletion, derivative_count, png_bytes, seed_bucket, test_env, upload};
use filevault::services::content_store::StoreError;
use filevault::services::transform_service::TransformRequest;
use uuid::Uuid;

fn thumb() -> TransformRequest {
    TransformRequest {
        w: Some(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn aged_derivatives_are_evicted() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (_, version) = upload(&env, bucket, owner, "pic.png", "image/png", &png_bytes(64, 64)).await;

    let derivative = env.transforms.resolve(version.id, &thumb()).await.unwrap();
    backdate_access(&env.db, derivative.id, Duration::days(31)).await;

    let report = env.sweeper.sweep().await.unwrap();

    assert_eq!(report.before.total_count, 1);
    assert_eq!(report.before.older_than_30d, 1);
    assert_eq!(report.aged.cleaned, 1);
    assert_eq!(report.aged.errors, 0);
    assert_eq!(report.after.total_count, 0);
    assert_eq!(derivative_count(&env.db).await, 0);
    assert!(matches!(
        env.store.get(&derivative.content_hash).await,
        Err(StoreError::BlobNotFound(_))
    ));
    // The source content is untouched.
    let source = env.versions.get_version(version.id).await.unwrap();
    assert!(env.store.get(&source.content_hash).await.is_ok());
}

#[tokio::test]
async fn recently_accessed_derivatives_survive() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (_, version) = upload(&env, bucket, owner, "pic.png", "image/png", &png_bytes(64, 64)).await;
    env.transforms.resolve(version.id, &thumb()).await.unwrap();

    let report = env.sweeper.sweep().await.unwrap();

    assert_eq!(report.aged.cleaned, 0);
    assert_eq!(report.orphaned.cleaned, 0);
    assert_eq!(report.before.accessed_within_24h, 1);
    assert_eq!(derivative_count(&env.db).await, 1);
}

#[tokio::test]
async fn orphaned_derivatives_are_evicted_regardless_of_age() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, version) = upload(&env, bucket, owner, "pic.png", "image/png", &png_bytes(64, 64)).await;
    env.transforms.resolve(version.id, &thumb()).await.unwrap();

    // Trashing the file orphans its derivatives even though they are fresh.
    env.trash.soft_delete(file.id).await.unwrap();
    let report = env.sweeper.sweep().await.unwrap();

    assert_eq!(report.orphaned.cleaned, 1);
    assert_eq!(derivative_count(&env.db).await, 0);
}

#[tokio::test]
async fn derivatives_without_a_file_row_are_orphans() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, version) = upload(&env, bucket, owner, "pic.png", "image/png", &png_bytes(64, 64)).await;
    env.transforms.resolve(version.id, &thumb()).await.unwrap();

    // Simulate a crashed permanent delete that removed the file but left the
    // derivative row behind.
    sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file.id)
        .execute(&*env.db)
        .await
        .unwrap();

    let report = env.sweeper.sweep().await.unwrap();
    assert_eq!(report.orphaned.cleaned, 1);
    assert_eq!(derivative_count(&env.db).await, 0);
}

#[tokio::test]
async fn expired_trash_is_purged() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;

    let (expired, v) = upload(&env, bucket, owner, "old.txt", "text/plain", b"old").await;
    let (kept, _) = upload(&env, bucket, owner, "new.txt", "text/plain", b"new").await;
    env.trash.soft_delete(expired.id).await.unwrap();
    env.trash.soft_delete(kept.id).await.unwrap();
    backdate_deletion(&env.db, expired.id, Duration::days(8)).await;

    let report = env.sweeper.sweep().await.unwrap();

    assert_eq!(report.expired_trash.cleaned, 1);
    assert!(env.versions.fetch_file(expired.id).await.is_err());
    assert!(matches!(
        env.store.get(&v.content_hash).await,
        Err(StoreError::BlobNotFound(_))
    ));
    // Still inside its window, still restorable.
    assert!(env.versions.fetch_file(kept.id).await.is_ok());
}

#[tokio::test]
async fn sweeping_an_empty_system_is_a_no_op() {
    let env = test_env().await;
    let report = env.sweeper.sweep().await.unwrap();
    assert_eq!(report.before.total_count, 0);
    assert_eq!(report.aged.cleaned + report.orphaned.cleaned + report.expired_trash.cleaned, 0);
    assert_eq!(report.aged.errors + report.orphaned.errors + report.expired_trash.errors, 0);
}
