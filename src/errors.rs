//! HTTP boundary error type.
//!
//! Services surface their own typed errors; this module folds them into a
//! single `ApiError` with a stable machine code, an HTTP status, and, for
//! transient failures, a `Retry-After` hint. Auth failures always fail
//! closed and are never marked retryable.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::{
    content_store::StoreError, signed_url::SignedUrlError, transform_service::TransformError,
    trash_service::TrashError, upload_service::UploadError, version_service::VersionError,
};

/// Seconds suggested to clients before retrying a transient failure.
const RETRY_AFTER_SECS: u32 = 2;

#[derive(Debug, Error)]
pub enum ApiError {
    // --- authentication / authorization: fail closed, never retryable ---
    #[error("signed URL has expired")]
    Expired,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("caller identity missing or malformed")]
    Unauthenticated,
    #[error("caller does not own this resource")]
    Forbidden,

    // --- validation: client-fixable ---
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid transform parameters: {0}")]
    InvalidTransformParams(String),
    #[error("MIME type `{0}` is not allowed in this bucket")]
    DisallowedMime(String),
    #[error("declared size {declared} exceeds the {max} byte upload limit")]
    UploadTooLarge { declared: i64, max: i64 },

    // --- not found / gone ---
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("upload session already consumed")]
    SessionConsumed,
    #[error("upload session expired")]
    SessionExpired,

    // --- conflict ---
    #[error("restore window expired")]
    RestoreWindowExpired,

    // --- transient infrastructure: retryable ---
    #[error("transform timed out")]
    TransformTimeout,
    #[error("transform failed: {0}")]
    TransformFailed(String),
    #[error("storage unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Expired => "url_expired",
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Forbidden => "forbidden",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidTransformParams(_) => "invalid_transform_params",
            ApiError::DisallowedMime(_) => "disallowed_mime",
            ApiError::UploadTooLarge { .. } => "upload_too_large",
            ApiError::NotFound(_) => "not_found",
            ApiError::SessionConsumed => "session_consumed",
            ApiError::SessionExpired => "session_expired",
            ApiError::RestoreWindowExpired => "restore_window_expired",
            ApiError::TransformTimeout => "transform_timeout",
            ApiError::TransformFailed(_) => "transform_failed",
            ApiError::Unavailable => "unavailable",
            ApiError::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Expired | ApiError::InvalidSignature | ApiError::Unauthenticated => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) | ApiError::InvalidTransformParams(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::DisallowedMime(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionConsumed | ApiError::SessionExpired => StatusCode::GONE,
            ApiError::RestoreWindowExpired => StatusCode::GONE,
            ApiError::TransformFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::TransformTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `Retry-After` seconds for failures worth retrying.
    fn retry_after(&self) -> Option<u32> {
        match self {
            ApiError::TransformTimeout | ApiError::TransformFailed(_) | ApiError::Unavailable => {
                Some(RETRY_AFTER_SECS)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BlobNotFound(_) => ApiError::NotFound("content"),
            StoreError::Sqlx(e) => {
                tracing::error!("metadata store error: {e}");
                ApiError::Unavailable
            }
            StoreError::Io(e) => {
                tracing::error!("blob store I/O error: {e}");
                ApiError::Unavailable
            }
        }
    }
}

impl From<VersionError> for ApiError {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::FileNotFound(_) => ApiError::NotFound("file"),
            VersionError::BucketNotFound(_) => ApiError::NotFound("bucket"),
            VersionError::VersionNotFound(_) => ApiError::NotFound("version"),
            VersionError::Store(e) => e.into(),
            VersionError::Sqlx(e) => {
                tracing::error!("version store error: {e}");
                ApiError::Unavailable
            }
        }
    }
}

impl From<TrashError> for ApiError {
    fn from(err: TrashError) -> Self {
        match err {
            TrashError::FileNotFound(_) => ApiError::NotFound("file"),
            TrashError::NotTrashed(_) => {
                ApiError::InvalidRequest("file is not in the trash".into())
            }
            TrashError::RestoreWindowExpired { .. } => ApiError::RestoreWindowExpired,
            TrashError::Store(e) => e.into(),
            TrashError::Sqlx(e) => {
                tracing::error!("trash store error: {e}");
                ApiError::Unavailable
            }
        }
    }
}

impl From<SignedUrlError> for ApiError {
    fn from(err: SignedUrlError) -> Self {
        match err {
            SignedUrlError::Expired => ApiError::Expired,
            SignedUrlError::InvalidSignature => ApiError::InvalidSignature,
            SignedUrlError::InvalidPurpose(p) => {
                ApiError::InvalidRequest(format!("unknown purpose `{p}`"))
            }
            SignedUrlError::MalformedExpiry => {
                ApiError::InvalidRequest("malformed expires parameter".into())
            }
        }
    }
}

impl From<TransformError> for ApiError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::InvalidParams(msg) => ApiError::InvalidTransformParams(msg),
            TransformError::UnknownPreset(p) => {
                ApiError::InvalidTransformParams(format!("unknown preset `{p}`"))
            }
            TransformError::NotAnImage(mime) => {
                ApiError::InvalidTransformParams(format!("`{mime}` is not a transformable image"))
            }
            TransformError::FileNotFound(_) => ApiError::NotFound("file"),
            TransformError::VersionNotFound(_) => ApiError::NotFound("version"),
            TransformError::Timeout => ApiError::TransformTimeout,
            TransformError::Failed(msg) => ApiError::TransformFailed(msg),
            TransformError::Store(e) => e.into(),
            TransformError::Sqlx(e) => {
                tracing::error!("derivative store error: {e}");
                ApiError::Unavailable
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::BucketNotFound(_) => ApiError::NotFound("bucket"),
            UploadError::SessionNotFound(_) => ApiError::NotFound("upload session"),
            UploadError::NotSessionOwner => ApiError::Forbidden,
            UploadError::SessionConsumed => ApiError::SessionConsumed,
            UploadError::SessionExpired => ApiError::SessionExpired,
            UploadError::DisallowedMime(mime) => ApiError::DisallowedMime(mime),
            UploadError::TooLarge { declared, max } => ApiError::UploadTooLarge { declared, max },
            UploadError::Sqlx(e) => {
                tracing::error!("upload store error: {e}");
                ApiError::Unavailable
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("resource"),
            other => {
                tracing::error!("database error: {other}");
                ApiError::Unavailable
            }
        }
    }
}
