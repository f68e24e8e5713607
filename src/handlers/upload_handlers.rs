//! Upload-session handlers: intent, completion, cancellation.
//!
//! Transport mechanics are deliberately simple — completion hands the core
//! a complete byte buffer; chunked/multipart transport lives outside the
//! core.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::handlers::caller_id;
use crate::models::{file::File, file::FileVersion, upload_session::UploadSession};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUploadReq {
    pub bucket_id: Uuid,
    pub filename: String,
    pub mime: String,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResp {
    pub file: File,
    pub version: FileVersion,
}

/// `POST /api/uploads` — open an upload session.
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateUploadReq>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    if req.filename.trim().is_empty() {
        return Err(ApiError::InvalidRequest("filename must not be empty".into()));
    }

    let bucket = state.versions.fetch_bucket(req.bucket_id).await?;
    if bucket.owner_id != caller {
        return Err(ApiError::Forbidden);
    }

    let session: UploadSession = state
        .uploads
        .create_session(req.bucket_id, caller, &req.filename, &req.mime, req.size)
        .await?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// `POST /api/uploads/{id}/complete` — body is the raw bytes.
///
/// Consumes the session exactly once, then commits through the version
/// manager and content store.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;

    let max = state.uploads.max_upload_bytes();
    if body.len() as i64 > max {
        return Err(ApiError::UploadTooLarge {
            declared: body.len() as i64,
            max,
        });
    }

    let session = state.uploads.take_session(session_id, caller).await?;

    let ingested = state
        .versions
        .ingest(
            session.bucket_id,
            caller,
            &session.filename,
            &session.object_key,
            &session.mime,
            &body,
        )
        .await;
    let (file, version) = match ingested {
        Ok(committed) => committed,
        Err(err) => {
            // Nothing was committed; give the session back so the owner can
            // retry rather than losing it to a transient failure.
            if let Err(reopen_err) = state.uploads.reopen_session(session_id).await {
                tracing::warn!(session = %session_id, "failed to reopen session: {reopen_err}");
            }
            return Err(err.into());
        }
    };

    tracing::info!(
        file = %file.id,
        version = version.version_no,
        size = version.size,
        "upload completed"
    );
    Ok((StatusCode::CREATED, Json(CompleteUploadResp { file, version })))
}

/// `DELETE /api/uploads/{id}` — cancel an open session. Owner only.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    state.uploads.cancel_session(session_id, caller).await?;
    Ok(StatusCode::NO_CONTENT)
}
