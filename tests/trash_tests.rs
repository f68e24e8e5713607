mod common;

use chrono::Duration;
use common::{backdate_deletion, bucket_counters, seed_bucket, test_env, upload};
use filevault::services::content_store::StoreError;
use filevault::services::trash_service::TrashError;
use uuid::Uuid;

#[tokio::test]
async fn soft_delete_hides_and_restore_brings_back() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"payload").await;

    let trashed = env.trash.soft_delete(file.id).await.unwrap();
    assert!(trashed.is_trashed());
    assert_eq!(bucket_counters(&env.db, bucket).await, (0, 0));

    // Content survives the trash.
    assert!(env.store.get(trashed.content_hash.as_deref().unwrap()).await.is_ok());

    let restored = env.trash.restore(file.id).await.unwrap();
    assert!(!restored.is_trashed());
    assert_eq!(bucket_counters(&env.db, bucket).await, (1, 7));
}

#[tokio::test]
async fn soft_delete_is_idempotent() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"x").await;

    let first = env.trash.soft_delete(file.id).await.unwrap();
    let second = env.trash.soft_delete(file.id).await.unwrap();
    assert_eq!(first.deleted_at, second.deleted_at);
    // Counters move only once.
    assert_eq!(bucket_counters(&env.db, bucket).await, (0, 0));
}

#[tokio::test]
async fn racing_soft_deletes_move_counters_once() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"payload").await;

    let (a, b) = tokio::join!(
        env.trash.soft_delete(file.id),
        env.trash.soft_delete(file.id),
    );
    assert!(a.unwrap().is_trashed());
    assert!(b.unwrap().is_trashed());

    // Only the call that flipped the row moved the counters.
    assert_eq!(bucket_counters(&env.db, bucket).await, (0, 0));
}

#[tokio::test]
async fn racing_restores_move_counters_once() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"payload").await;
    env.trash.soft_delete(file.id).await.unwrap();

    let (a, b) = tokio::join!(env.trash.restore(file.id), env.trash.restore(file.id));
    // The loser either sees the file already active up front or loses the
    // conditional update; neither outcome may move the counters again.
    for outcome in [a, b] {
        if let Err(err) = outcome {
            assert!(matches!(err, TrashError::NotTrashed(_)));
        }
    }

    let restored = env.versions.fetch_file(file.id).await.unwrap();
    assert!(!restored.is_trashed());
    assert_eq!(bucket_counters(&env.db, bucket).await, (1, 7));
}

#[tokio::test]
async fn restore_respects_the_retention_window() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;

    let (inside, _) = upload(&env, bucket, owner, "inside.txt", "text/plain", b"a").await;
    let (outside, _) = upload(&env, bucket, owner, "outside.txt", "text/plain", b"b").await;
    env.trash.soft_delete(inside.id).await.unwrap();
    env.trash.soft_delete(outside.id).await.unwrap();

    // One hour before the window closes: still restorable.
    backdate_deletion(&env.db, inside.id, Duration::days(6) + Duration::hours(23)).await;
    assert!(env.trash.restore(inside.id).await.is_ok());

    // One hour past the window: lapsed.
    backdate_deletion(&env.db, outside.id, Duration::days(7) + Duration::hours(1)).await;
    assert!(matches!(
        env.trash.restore(outside.id).await,
        Err(TrashError::RestoreWindowExpired { .. })
    ));
}

#[tokio::test]
async fn restoring_an_active_file_fails() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;
    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"x").await;

    assert!(matches!(
        env.trash.restore(file.id).await,
        Err(TrashError::NotTrashed(_))
    ));
}

#[tokio::test]
async fn permanent_delete_keeps_blobs_shared_with_siblings() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;

    let (a, v_a) = upload(&env, bucket, owner, "a.bin", "application/octet-stream", b"dup").await;
    let (b, _) = upload(&env, bucket, owner, "b.bin", "application/octet-stream", b"dup").await;

    env.trash.permanent_delete(a.id).await.unwrap();

    // The sibling still references the content.
    assert!(env.store.get(&v_a.content_hash).await.is_ok());
    assert!(env.versions.fetch_file(a.id).await.is_err());

    env.trash.permanent_delete(b.id).await.unwrap();
    assert!(matches!(
        env.store.get(&v_a.content_hash).await,
        Err(StoreError::BlobNotFound(_))
    ));
    assert_eq!(bucket_counters(&env.db, bucket).await, (0, 0));
}

#[tokio::test]
async fn permanent_delete_of_a_missing_file_is_a_soft_success() {
    let env = test_env().await;
    assert!(env.trash.permanent_delete(Uuid::new_v4()).await.is_ok());
}

#[tokio::test]
async fn permanent_delete_removes_every_version() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;

    let (file, _) = upload(&env, bucket, owner, "doc.txt", "text/plain", b"v1").await;
    upload(&env, bucket, owner, "doc.txt", "text/plain", b"v2").await;
    upload(&env, bucket, owner, "doc.txt", "text/plain", b"v3").await;

    env.trash.permanent_delete(file.id).await.unwrap();

    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_versions WHERE file_id = ?")
        .bind(file.id)
        .fetch_one(&*env.db)
        .await
        .unwrap();
    assert_eq!(versions, 0);
    let blobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_blobs")
        .fetch_one(&*env.db)
        .await
        .unwrap();
    assert_eq!(blobs, 0);
}

#[tokio::test]
async fn trash_listing_derives_the_expired_flag() {
    let env = test_env().await;
    let owner = Uuid::new_v4();
    let bucket = seed_bucket(&env.db, owner, true, None).await;

    let (fresh, _) = upload(&env, bucket, owner, "fresh.txt", "text/plain", b"a").await;
    let (stale, _) = upload(&env, bucket, owner, "stale.txt", "text/plain", b"b").await;
    env.trash.soft_delete(stale.id).await.unwrap();
    backdate_deletion(&env.db, stale.id, Duration::days(9)).await;
    env.trash.soft_delete(fresh.id).await.unwrap();

    let entries = env.trash.list_trash(owner).await.unwrap();
    assert_eq!(entries.len(), 2);
    // Newest deletion first.
    assert_eq!(entries[0].file.id, fresh.id);
    assert!(!entries[0].expired);
    assert_eq!(entries[1].file.id, stale.id);
    assert!(entries[1].expired);

    // Another user sees nothing.
    assert!(env.trash.list_trash(Uuid::new_v4()).await.unwrap().is_empty());
}
