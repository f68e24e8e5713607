//! Derivative request handler.

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::handlers::caller_id;
use crate::services::signed_url::Purpose;
use crate::services::transform_service::TransformRequest;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TransformResp {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub width: i64,
    pub height: i64,
    pub format: String,
    pub size: i64,
    pub mime_type: String,
}

/// `POST /api/files/{id}/transform` — resolve (or generate) a derivative of
/// the file's current version and hand back a signed URL for it.
pub async fn transform_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<TransformRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    let file = state.versions.fetch_file(file_id).await?;
    if file.user_id != caller {
        return Err(ApiError::Forbidden);
    }
    if file.is_trashed() {
        return Err(ApiError::NotFound("file"));
    }
    let version_id = file
        .current_version_id
        .ok_or(ApiError::NotFound("version"))?;

    let derivative = state.transforms.resolve(version_id, &req).await?;

    let purpose = Purpose::Transform;
    let signed = state.gate.issue(
        &derivative.object_key(),
        purpose,
        Duration::from_secs(u64::from(purpose.cache_ttl_secs())),
    );

    let format = derivative
        .mime
        .strip_prefix("image/")
        .unwrap_or(&derivative.mime)
        .to_string();

    Ok(Json(TransformResp {
        url: signed.url,
        expires_at: signed.expires_at,
        width: derivative.width,
        height: derivative.height,
        format,
        size: derivative.size,
        mime_type: derivative.mime,
    }))
}
