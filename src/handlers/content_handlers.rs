//! Byte-delivery handlers: the signed-URL gate in front of every private
//! read, and the public bypass.
//!
//! Object keys are a separate namespace from content hashes: `d/{id}`
//! addresses a derivative, `v/{id}` a specific version snapshot, and
//! anything else is a file's own key resolving to its current content.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::derivative::Derivative;
use crate::services::signed_url::Purpose;
use crate::state::AppState;

/// Edge cache directive for derivative bytes; their content is immutable
/// once generated.
const DERIVATIVE_CACHE_CONTROL: &str = "public, max-age=2592000, immutable";
/// Cache policy for public originals.
const PUBLIC_CACHE_CONTROL: &str = "public, max-age=86400";

#[derive(Debug, Deserialize)]
pub struct GateQuery {
    pub expires: Option<String>,
    pub signature: Option<String>,
    pub purpose: Option<String>,
}

/// What an object key resolves to, ready for delivery.
struct ServeTarget {
    hash: String,
    mime: String,
    filename: String,
    is_derivative: bool,
}

/// `GET /files/{*object_key}` — gated read path for originals, version
/// snapshots, and derivatives.
pub async fn get_object(
    State(state): State<AppState>,
    Path(object_key): Path<String>,
    Query(query): Query<GateQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let purpose: Purpose = query
        .purpose
        .as_deref()
        .unwrap_or("download")
        .parse()
        .map_err(ApiError::from)?;
    let expires: i64 = query
        .expires
        .as_deref()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::InvalidRequest("malformed expires parameter".into()))?;
    let signature = query
        .signature
        .as_deref()
        .ok_or(ApiError::InvalidSignature)?;

    state
        .gate
        .validate(&object_key, expires, signature, purpose)?;

    let target = resolve_object_key(&state, &object_key).await?;
    serve(&state, target, purpose, &headers).await
}

/// `GET /public/{*object_key}` — public files skip the gate and get a
/// long-lived cache policy.
pub async fn get_public_object(
    State(state): State<AppState>,
    Path(object_key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let file = state
        .versions
        .find_by_object_key(&object_key)
        .await?
        .ok_or(ApiError::NotFound("file"))?;
    if !file.is_public || file.is_trashed() {
        return Err(ApiError::NotFound("file"));
    }
    let hash = file.content_hash.clone().ok_or(ApiError::NotFound("content"))?;

    let target = ServeTarget {
        hash,
        mime: file.mime,
        filename: file.name,
        is_derivative: false,
    };

    let mut response = serve(&state, target, Purpose::Preview, &headers).await?;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(PUBLIC_CACHE_CONTROL),
    );
    Ok(response)
}

/// Resolve an object key through the derivative / version / file
/// namespaces. Soft-deleted files hide everything hanging off them.
async fn resolve_object_key(state: &AppState, object_key: &str) -> Result<ServeTarget, ApiError> {
    if let Some(id) = object_key.strip_prefix("d/").and_then(|s| Uuid::parse_str(s).ok()) {
        let derivative = sqlx::query_as::<_, Derivative>(
            "SELECT id, file_id, file_version_id, transform_key, content_hash, mime,
                    width, height, size, created_at, accessed_at
             FROM derivatives WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*state.db)
        .await?
        .ok_or(ApiError::NotFound("derivative"))?;

        let file = state.versions.fetch_file(derivative.file_id).await?;
        if file.is_trashed() {
            return Err(ApiError::NotFound("file"));
        }
        return Ok(ServeTarget {
            hash: derivative.content_hash,
            mime: derivative.mime,
            filename: file.name,
            is_derivative: true,
        });
    }

    if let Some(id) = object_key.strip_prefix("v/").and_then(|s| Uuid::parse_str(s).ok()) {
        let version = state.versions.get_version(id).await?;
        let file = state.versions.fetch_file(version.file_id).await?;
        if file.is_trashed() {
            return Err(ApiError::NotFound("file"));
        }
        return Ok(ServeTarget {
            hash: version.content_hash,
            mime: version.mime,
            filename: file.name,
            is_derivative: false,
        });
    }

    let file = state
        .versions
        .find_by_object_key(object_key)
        .await?
        .ok_or(ApiError::NotFound("file"))?;
    if file.is_trashed() {
        return Err(ApiError::NotFound("file"));
    }
    let hash = file.content_hash.clone().ok_or(ApiError::NotFound("content"))?;
    Ok(ServeTarget {
        hash,
        mime: file.mime,
        filename: file.name,
        is_derivative: false,
    })
}

/// Stream a blob out with delivery headers; honours byte ranges for
/// audio/video types.
async fn serve(
    state: &AppState,
    target: ServeTarget,
    purpose: Purpose,
    req_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let (blob, mut file) = state.store.reader(&target.hash).await?;
    let total = blob.size.max(0) as u64;
    let rangeable = supports_ranges(&target.mime);

    let range = if rangeable {
        req_headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| parse_range(v, total))
    } else {
        None
    };

    let mut response = match range {
        Some(Some((start, end))) => {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::Unavailable)?;
            let len = end - start + 1;
            let stream = ReaderStream::new(file.take(len));
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{total}")),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_value(&len.to_string()));
            response
        }
        Some(None) => {
            // Malformed or unsatisfiable range on a rangeable type.
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes */{total}")),
            );
            return Ok(response);
        }
        None => {
            let stream = ReaderStream::new(file);
            let mut response = Response::new(Body::from_stream(stream));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_value(&total.to_string()));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(&target.mime));
    headers.insert(header::ETAG, header_value(&format!("\"{}\"", target.hash)));
    let disposition = if purpose == Purpose::Download {
        format!("attachment; filename=\"{}\"", sanitize_filename(&target.filename))
    } else {
        "inline".to_string()
    };
    headers.insert(header::CONTENT_DISPOSITION, header_value(&disposition));
    if rangeable {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    let cache_control = if target.is_derivative {
        DERIVATIVE_CACHE_CONTROL.to_string()
    } else {
        format!("private, max-age={}", purpose.cache_ttl_secs())
    };
    headers.insert(header::CACHE_CONTROL, header_value(&cache_control));

    Ok(response)
}

fn supports_ranges(mime: &str) -> bool {
    mime.starts_with("audio/") || mime.starts_with("video/")
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect()
}

/// Parse `bytes=start-end` against a known size.
///
/// Returns `None` for malformed or unsatisfiable ranges. Supports the
/// open-ended (`bytes=100-`) and suffix (`bytes=-100`) forms.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = value.strip_prefix("bytes=")?;
    // Multi-range requests are not supported; serve the first range only if
    // it is the sole one.
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;

    match (start_s.is_empty(), end_s.is_empty()) {
        (true, true) => None,
        // suffix form: last N bytes
        (true, false) => {
            let suffix: u64 = end_s.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            let start = total.saturating_sub(suffix);
            Some((start, total - 1))
        }
        // open-ended form: start to EOF
        (false, true) => {
            let start: u64 = start_s.parse().ok()?;
            if start >= total {
                return None;
            }
            Some((start, total - 1))
        }
        (false, false) => {
            let start: u64 = start_s.parse().ok()?;
            let end: u64 = end_s.parse().ok()?;
            if start > end || start >= total {
                return None;
            }
            Some((start, end.min(total - 1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ranges_clamp_to_size() {
        assert_eq!(parse_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_range("bytes=500-2000", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=0-0", 1000), Some((0, 0)));
    }

    #[test]
    fn open_ended_and_suffix_forms() {
        assert_eq!(parse_range("bytes=900-", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=-2000", 1000), Some((0, 999)));
    }

    #[test]
    fn malformed_and_unsatisfiable_ranges() {
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=", 1000), None);
        assert_eq!(parse_range("bites=0-10", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }

    #[test]
    fn only_av_types_are_rangeable() {
        assert!(supports_ranges("audio/mpeg"));
        assert!(supports_ranges("video/mp4"));
        assert!(!supports_ranges("image/png"));
        assert!(!supports_ranges("application/pdf"));
    }
}
