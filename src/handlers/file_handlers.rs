//! File metadata, version history, trash, and link-issuance handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::handlers::caller_id;
use crate::models::file::File;
use crate::services::signed_url::Purpose;
use crate::state::AppState;

/// Longest TTL a client may request for a signed link.
const MAX_LINK_TTL_SECS: u64 = 24 * 60 * 60;

async fn fetch_owned_file(state: &AppState, file_id: Uuid, caller: Uuid) -> Result<File, ApiError> {
    let file = state.versions.fetch_file(file_id).await?;
    if file.user_id != caller {
        return Err(ApiError::Forbidden);
    }
    Ok(file)
}

/// `GET /api/files/{id}` — metadata, trashed or not.
pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    let file = fetch_owned_file(&state, file_id, caller).await?;
    Ok(Json(file))
}

/// `GET /api/files/{id}/versions` — history, newest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    fetch_owned_file(&state, file_id, caller).await?;
    let versions = state.versions.list_versions(file_id).await?;
    Ok(Json(versions))
}

/// `POST /api/files/{id}/versions/{version_id}/restore` — append a new
/// version with the old content.
pub async fn restore_version(
    State(state): State<AppState>,
    Path((file_id, version_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    fetch_owned_file(&state, file_id, caller).await?;
    let version = state.versions.restore_version(file_id, version_id).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

/// `DELETE /api/files/{id}` — move to trash.
pub async fn soft_delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    fetch_owned_file(&state, file_id, caller).await?;
    let file = state.trash.soft_delete(file_id).await?;
    Ok(Json(file))
}

/// `POST /api/files/{id}/restore` — take a file back out of the trash.
pub async fn restore_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    fetch_owned_file(&state, file_id, caller).await?;
    let file = state.trash.restore(file_id).await?;
    Ok(Json(file))
}

/// `DELETE /api/files/{id}/permanent` — remove the file for good, trashed
/// or not.
pub async fn permanent_delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    fetch_owned_file(&state, file_id, caller).await?;
    state.trash.permanent_delete(file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/trash` — the caller's trashed files with derived expiry.
pub async fn list_trash(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    let entries = state.trash.list_trash(caller).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct IssueLinkReq {
    pub purpose: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct IssueLinkResp {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub purpose: String,
}

/// `POST /api/files/{id}/link` — issue a signed URL for one purpose.
///
/// Public files bypass the gate entirely and get a bare public URL with no
/// expiry.
pub async fn issue_link(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<IssueLinkReq>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_id(&headers)?;
    let file = fetch_owned_file(&state, file_id, caller).await?;
    if file.is_trashed() {
        return Err(ApiError::NotFound("file"));
    }

    let purpose: Purpose = req.purpose.parse().map_err(ApiError::from)?;
    if file.is_public {
        return Ok(Json(IssueLinkResp {
            url: state.gate.public_url(&file.object_key),
            expires_at: None,
            purpose: purpose.to_string(),
        }));
    }

    let ttl = req
        .ttl_secs
        .unwrap_or(u64::from(purpose.cache_ttl_secs()))
        .clamp(1, MAX_LINK_TTL_SECS);
    let signed = state
        .gate
        .issue(&file.object_key, purpose, Duration::from_secs(ttl));

    Ok(Json(IssueLinkResp {
        url: signed.url,
        expires_at: Some(signed.expires_at),
        purpose: purpose.to_string(),
    }))
}
