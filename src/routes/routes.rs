//! Defines routes for all file, upload, trash, and delivery operations.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /api/uploads` — open an upload session
//!   - `POST   /api/uploads/{id}/complete` — commit the bytes
//!   - `DELETE /api/uploads/{id}` — cancel
//!
//! - **Files, versions, trash**
//!   - `GET    /api/files/{id}` — metadata
//!   - `GET    /api/files/{id}/versions` — version history
//!   - `POST   /api/files/{id}/versions/{version_id}/restore`
//!   - `DELETE /api/files/{id}` — soft delete
//!   - `POST   /api/files/{id}/restore` — restore from trash
//!   - `DELETE /api/files/{id}/permanent` — permanent delete
//!   - `GET    /api/trash` — trash listing
//!   - `POST   /api/files/{id}/link` — issue a signed URL
//!   - `POST   /api/files/{id}/transform` — cached derivative
//!
//! - **Delivery**
//!   - `GET /files/{*object_key}` — signed reads (wildcard keys allowed)
//!   - `GET /public/{*object_key}` — public bypass
//!
//! - **Operations**: `/healthz`, `/readyz`, `POST /api/admin/sweep`

use crate::{
    handlers::{
        admin_handlers::run_sweep,
        content_handlers::{get_object, get_public_object},
        file_handlers::{
            get_file, issue_link, list_trash, list_versions, permanent_delete_file, restore_file,
            restore_version, soft_delete_file,
        },
        health_handlers::{healthz, readyz},
        transform_handlers::transform_file,
        upload_handlers::{cancel_upload, complete_upload, create_upload},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router for the whole API surface.
///
/// `max_body_bytes` raises axum's default body limit so upload completion
/// can carry a full object.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload sessions
        .route("/api/uploads", post(create_upload))
        .route(
            "/api/uploads/{id}/complete",
            post(complete_upload).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .route("/api/uploads/{id}", delete(cancel_upload))
        // files, versions, trash
        .route(
            "/api/files/{id}",
            get(get_file).delete(soft_delete_file),
        )
        .route("/api/files/{id}/versions", get(list_versions))
        .route(
            "/api/files/{id}/versions/{version_id}/restore",
            post(restore_version),
        )
        .route("/api/files/{id}/restore", post(restore_file))
        .route("/api/files/{id}/permanent", delete(permanent_delete_file))
        .route("/api/trash", get(list_trash))
        .route("/api/files/{id}/link", post(issue_link))
        .route("/api/files/{id}/transform", post(transform_file))
        // delivery
        .route("/files/{*object_key}", get(get_object))
        .route("/public/{*object_key}", get(get_public_object))
        // operations
        .route("/api/admin/sweep", post(run_sweep))
}
