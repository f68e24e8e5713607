//! HTTP handlers. Thin request/response shaping over the service layer;
//! every operation has an explicit request struct validated before any
//! component logic runs.

pub mod admin_handlers;
pub mod content_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod transform_handlers;
pub mod upload_handlers;

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::errors::ApiError;

/// Extract the opaque caller identity.
///
/// Authentication itself is an external collaborator; by the time a request
/// reaches the core the caller is an `X-User-Id` header carrying a UUID.
pub fn caller_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(ApiError::Unauthenticated)
}
