//! Shared application state handed to every handler.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::{
    content_store::ContentStore, signed_url::SignedUrlGate, sweeper::Sweeper,
    transform_service::TransformService, trash_service::TrashService,
    upload_service::UploadService, version_service::VersionService,
};

/// All services wired around one injected pool; constructed once at startup
/// and cloned into handlers. No ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub store: ContentStore,
    pub versions: VersionService,
    pub trash: TrashService,
    pub uploads: UploadService,
    pub transforms: TransformService,
    pub gate: SignedUrlGate,
    pub sweeper: Sweeper,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig) -> Self {
        let store = ContentStore::new(db.clone(), &cfg.storage_dir);
        let versions = VersionService::new(db.clone(), store.clone());
        let trash = TrashService::new(db.clone(), store.clone(), cfg.trash_retention_days);
        let uploads = UploadService::new(db.clone(), cfg.max_upload_bytes);
        let transforms = TransformService::new(
            db.clone(),
            store.clone(),
            cfg.max_concurrent_encodes,
            Duration::from_secs(cfg.transform_deadline_secs),
        );
        let gate = SignedUrlGate::new(cfg.signing_secret.as_bytes(), cfg.public_base_url.clone());
        let sweeper = Sweeper::new(
            db.clone(),
            store.clone(),
            trash.clone(),
            cfg.sweep_batch_size,
        );

        Self {
            db,
            store,
            versions,
            trash,
            uploads,
            transforms,
            gate,
            sweeper,
        }
    }
}
