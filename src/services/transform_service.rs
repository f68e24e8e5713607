//! Derivative cache: canonical key derivation, generation-on-miss with
//! single-flight coalescing, and the CPU-bound resize/re-encode pipeline.
//!
//! A derivative is unique per `(file_version_id, transform_key)`. Hits cost
//! one UPDATE (bumping `accessed_at`); misses fetch the source blob, encode
//! on the blocking pool under a semaphore and a deadline, persist the output
//! through the content store, and insert the metadata row. Concurrent misses
//! for the same key are serialized through a per-key mutex so exactly one
//! generation runs; losers re-read the freshly cached row.

use chrono::Utc;
use dashmap::DashMap;
use image::{DynamicImage, GenericImageView, ImageFormat, imageops::FilterType};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::derivative::Derivative;
use crate::services::content_store::{ContentStore, StoreError, content_hash};

/// Inclusive bounds for requested dimensions.
pub const MIN_DIMENSION: u32 = 1;
pub const MAX_DIMENSION: u32 = 2048;
/// Encoding quality used when the request leaves it unspecified.
pub const DEFAULT_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    #[error("`{0}` is not a transformable image type")]
    NotAnImage(String),
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("version `{0}` not found")]
    VersionNotFound(Uuid),
    #[error("transform generation timed out")]
    Timeout,
    #[error("transform generation failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type TransformResult<T> = Result<T, TransformError>;

/// Supported output encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }

    /// Source MIME types that are kept as-is when no output format is
    /// requested; everything else re-encodes to WebP.
    fn from_compatible_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(OutputFormat::Jpeg),
            "image/png" => Some(OutputFormat::Png),
            "image/webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            "avif" => Ok(OutputFormat::Avif),
            other => Err(TransformError::InvalidParams(format!(
                "unsupported format `{other}` (expected jpeg, png, webp, or avif)"
            ))),
        }
    }
}

/// The raw, client-facing request shape: explicit parameters or a preset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformRequest {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub q: Option<u8>,
    pub format: Option<String>,
    pub preset: Option<String>,
}

/// Validated, normalized transform parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<OutputFormat>,
}

impl TransformParams {
    /// Resolve a request into validated parameters: named presets expand
    /// first, then explicit fields are range-checked. Violations never reach
    /// generation.
    pub fn from_request(req: &TransformRequest) -> TransformResult<Self> {
        let mut params = match req.preset.as_deref() {
            Some(name) => preset(name).ok_or_else(|| {
                TransformError::UnknownPreset(name.to_string())
            })?,
            None => TransformParams {
                width: None,
                height: None,
                quality: None,
                format: None,
            },
        };

        // Explicit fields override the preset bundle.
        if req.w.is_some() {
            params.width = req.w;
        }
        if req.h.is_some() {
            params.height = req.h;
        }
        if req.q.is_some() {
            params.quality = req.q;
        }
        if let Some(fmt_str) = req.format.as_deref() {
            params.format = Some(fmt_str.parse()?);
        }

        for (label, value) in [("width", params.width), ("height", params.height)] {
            if let Some(v) = value {
                if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&v) {
                    return Err(TransformError::InvalidParams(format!(
                        "{label} {v} out of range [{MIN_DIMENSION}, {MAX_DIMENSION}]"
                    )));
                }
            }
        }
        if let Some(q) = params.quality {
            if !(1..=100).contains(&q) {
                return Err(TransformError::InvalidParams(format!(
                    "quality {q} out of range [1, 100]"
                )));
            }
        }
        if params.width.is_none() && params.height.is_none() && params.format.is_none() {
            return Err(TransformError::InvalidParams(
                "at least one of w, h, format, or preset is required".into(),
            ));
        }

        Ok(params)
    }

    /// Canonical serialization: fixed field order, absent fields dropped.
    fn canonical(&self) -> String {
        let mut parts = Vec::new();
        if let Some(f) = self.format {
            parts.push(format!("f={f}"));
        }
        if let Some(h) = self.height {
            parts.push(format!("h={h}"));
        }
        if let Some(q) = self.quality {
            parts.push(format!("q={q}"));
        }
        if let Some(w) = self.width {
            parts.push(format!("w={w}"));
        }
        parts.join(",")
    }

    /// Deterministic digest of the canonical form. A cryptographic digest
    /// over a stable serialization makes collisions impossible for the
    /// closed parameter space.
    pub fn transform_key(&self) -> String {
        content_hash(self.canonical().as_bytes())[..32].to_string()
    }
}

/// Named parameter bundles resolved before validation.
fn preset(name: &str) -> Option<TransformParams> {
    let bundle = |dim: u32, format: OutputFormat| TransformParams {
        width: Some(dim),
        height: Some(dim),
        quality: Some(DEFAULT_QUALITY),
        format: Some(format),
    };
    match name {
        "thumbnail" => Some(bundle(150, OutputFormat::Webp)),
        "small" => Some(bundle(320, OutputFormat::Webp)),
        "medium" => Some(bundle(640, OutputFormat::Webp)),
        "large" => Some(bundle(1280, OutputFormat::Webp)),
        "thumbnail-jpeg" => Some(bundle(150, OutputFormat::Jpeg)),
        "small-jpeg" => Some(bundle(320, OutputFormat::Jpeg)),
        "medium-jpeg" => Some(bundle(640, OutputFormat::Jpeg)),
        "large-jpeg" => Some(bundle(1280, OutputFormat::Jpeg)),
        _ => None,
    }
}

struct EncodedImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    format: OutputFormat,
}

#[derive(Clone)]
pub struct TransformService {
    db: Arc<SqlitePool>,
    store: ContentStore,
    /// Per-key single-flight locks; entries are removed once a flight ends.
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Bounds concurrent CPU-heavy encodes so they cannot starve I/O.
    encode_slots: Arc<Semaphore>,
    deadline: Duration,
}

const DERIVATIVE_COLUMNS: &str = "id, file_id, file_version_id, transform_key, content_hash, \
     mime, width, height, size, created_at, accessed_at";

impl TransformService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: ContentStore,
        max_concurrent_encodes: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            db,
            store,
            inflight: Arc::new(DashMap::new()),
            encode_slots: Arc::new(Semaphore::new(max_concurrent_encodes.max(1))),
            deadline,
        }
    }

    /// Resolve a transform request against a file version: cached metadata
    /// on a hit, exactly one generation on concurrent misses.
    pub async fn resolve(
        &self,
        file_version_id: Uuid,
        req: &TransformRequest,
    ) -> TransformResult<Derivative> {
        let params = TransformParams::from_request(req)?;
        let key = params.transform_key();

        if let Some(hit) = self.lookup_and_touch(file_version_id, &key).await? {
            return Ok(hit);
        }

        let flight_key = format!("{file_version_id}:{key}");
        let lock = self
            .inflight
            .entry(flight_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // A loser of the race finds the winner's row here and never encodes.
        let result = match self.lookup_and_touch(file_version_id, &key).await? {
            Some(hit) => Ok(hit),
            None => self.generate(file_version_id, &params, &key).await,
        };

        drop(guard);
        self.inflight.remove(&flight_key);
        result
    }

    /// Cache hit path: one statement bumps `accessed_at` and returns the row.
    async fn lookup_and_touch(
        &self,
        file_version_id: Uuid,
        transform_key: &str,
    ) -> TransformResult<Option<Derivative>> {
        let hit = sqlx::query_as::<_, Derivative>(&format!(
            "UPDATE derivatives SET accessed_at = ?
             WHERE file_version_id = ? AND transform_key = ?
             RETURNING {DERIVATIVE_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(file_version_id)
        .bind(transform_key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(hit)
    }

    async fn generate(
        &self,
        file_version_id: Uuid,
        params: &TransformParams,
        transform_key: &str,
    ) -> TransformResult<Derivative> {
        let version = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT file_id, content_hash, mime FROM file_versions WHERE id = ?",
        )
        .bind(file_version_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(TransformError::VersionNotFound(file_version_id))?;
        let (file_id, source_hash, source_mime) = version;

        if !source_mime.starts_with("image/") {
            return Err(TransformError::NotAnImage(source_mime));
        }

        let source = self.store.get(&source_hash).await?;

        let permit = self
            .encode_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransformError::Failed("encode pool closed".into()))?;

        let encode_params = *params;
        let encode_mime = source_mime.clone();
        let encoded = tokio::time::timeout(
            self.deadline,
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                encode(&source, &encode_params, &encode_mime)
            }),
        )
        .await
        .map_err(|_| TransformError::Timeout)?
        .map_err(|join| TransformError::Failed(join.to_string()))??;

        let blob = self.store.put(&encoded.bytes).await?;
        let now = Utc::now();
        let id = Uuid::new_v4();

        // Another process may have inserted between our lookup and here; the
        // conflict arm turns that into a plain touch of the existing row.
        let row = sqlx::query_as::<_, Derivative>(&format!(
            "INSERT INTO derivatives (id, file_id, file_version_id, transform_key, content_hash,
                                      mime, width, height, size, created_at, accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(file_version_id, transform_key)
                 DO UPDATE SET accessed_at = excluded.accessed_at
             RETURNING {DERIVATIVE_COLUMNS}"
        ))
        .bind(id)
        .bind(file_id)
        .bind(file_version_id)
        .bind(transform_key)
        .bind(&blob.hash)
        .bind(encoded.format.mime())
        .bind(encoded.width as i64)
        .bind(encoded.height as i64)
        .bind(blob.size)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        if row.id != id {
            // Lost a cross-process race; release our duplicate output if it
            // differs from the winner's.
            if row.content_hash != blob.hash {
                if let Err(err) = self.store.delete(&blob.hash).await {
                    warn!(hash = %blob.hash, "failed to release duplicate derivative blob: {err}");
                }
            }
        } else {
            debug!(
                %file_version_id,
                transform_key,
                width = row.width,
                height = row.height,
                "generated derivative"
            );
        }

        Ok(row)
    }
}

/// The CPU-bound pipeline: decode, fit-inside resize without upscaling,
/// re-encode. Runs on the blocking pool.
fn encode(
    source: &[u8],
    params: &TransformParams,
    source_mime: &str,
) -> TransformResult<EncodedImage> {
    let img =
        image::load_from_memory(source).map_err(|err| TransformError::Failed(err.to_string()))?;
    let (orig_w, orig_h) = img.dimensions();

    // Fit inside the requested box, never growing beyond the original.
    let bound_w = params.width.unwrap_or(orig_w).min(orig_w);
    let bound_h = params.height.unwrap_or(orig_h).min(orig_h);
    let img = if bound_w < orig_w || bound_h < orig_h {
        img.resize(bound_w, bound_h, FilterType::Lanczos3)
    } else {
        img
    };
    let (out_w, out_h) = img.dimensions();

    let format = params
        .format
        .or_else(|| OutputFormat::from_compatible_mime(source_mime))
        .unwrap_or(OutputFormat::Webp);
    let quality = params.quality.unwrap_or(DEFAULT_QUALITY);

    let mut bytes = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|err| TransformError::Failed(err.to_string()))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
                .map_err(|err| TransformError::Failed(err.to_string()))?;
        }
        OutputFormat::Webp => {
            // The webp encoder is lossless; quality does not apply.
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut bytes);
            img.write_with_encoder(encoder)
                .map_err(|err| TransformError::Failed(err.to_string()))?;
        }
        OutputFormat::Avif => {
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut bytes, 8, quality);
            img.write_with_encoder(encoder)
                .map_err(|err| TransformError::Failed(err.to_string()))?;
        }
    }

    Ok(EncodedImage {
        bytes,
        width: out_w,
        height: out_h,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(
        w: Option<u32>,
        h: Option<u32>,
        q: Option<u8>,
        format: Option<&str>,
    ) -> TransformRequest {
        TransformRequest {
            w,
            h,
            q,
            format: format.map(String::from),
            preset: None,
        }
    }

    #[test]
    fn key_is_stable_and_order_independent_of_input() {
        let a = TransformParams::from_request(&req(Some(300), Some(300), Some(85), Some("webp")))
            .unwrap();
        let b = TransformParams::from_request(&req(Some(300), Some(300), Some(85), Some("webp")))
            .unwrap();
        assert_eq!(a.transform_key(), b.transform_key());
        assert_eq!(a.transform_key().len(), 32);
    }

    #[test]
    fn absent_fields_are_dropped_from_the_canonical_form() {
        let only_width = TransformParams::from_request(&req(Some(300), None, None, None)).unwrap();
        assert_eq!(only_width.canonical(), "w=300");

        let full = TransformParams::from_request(&req(Some(300), Some(200), Some(90), Some("png")))
            .unwrap();
        assert_eq!(full.canonical(), "f=png,h=200,q=90,w=300");
    }

    #[test]
    fn different_params_yield_different_keys() {
        let a = TransformParams::from_request(&req(Some(300), None, None, None)).unwrap();
        let b = TransformParams::from_request(&req(Some(301), None, None, None)).unwrap();
        assert_ne!(a.transform_key(), b.transform_key());
    }

    #[test]
    fn dimension_bounds_are_enforced() {
        assert!(TransformParams::from_request(&req(Some(0), None, None, None)).is_err());
        assert!(TransformParams::from_request(&req(Some(2049), None, None, None)).is_err());
        assert!(TransformParams::from_request(&req(Some(2048), None, None, None)).is_ok());
        assert!(TransformParams::from_request(&req(Some(1), None, None, None)).is_ok());
    }

    #[test]
    fn quality_bounds_are_enforced() {
        assert!(TransformParams::from_request(&req(Some(100), None, Some(0), None)).is_err());
        assert!(TransformParams::from_request(&req(Some(100), None, Some(101), None)).is_err());
        assert!(TransformParams::from_request(&req(Some(100), None, Some(100), None)).is_ok());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(TransformParams::from_request(&req(Some(100), None, None, Some("tiff"))).is_err());
        assert!(TransformParams::from_request(&req(Some(100), None, None, Some("jpg"))).is_ok());
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(TransformParams::from_request(&req(None, None, None, None)).is_err());
    }

    #[test]
    fn presets_expand_and_explicit_fields_override() {
        let thumb = TransformRequest {
            preset: Some("thumbnail".into()),
            ..Default::default()
        };
        let p = TransformParams::from_request(&thumb).unwrap();
        assert_eq!(p.width, Some(150));
        assert_eq!(p.format, Some(OutputFormat::Webp));

        let override_fmt = TransformRequest {
            preset: Some("thumbnail".into()),
            format: Some("jpeg".into()),
            ..Default::default()
        };
        let p = TransformParams::from_request(&override_fmt).unwrap();
        assert_eq!(p.format, Some(OutputFormat::Jpeg));

        let bad = TransformRequest {
            preset: Some("gigantic".into()),
            ..Default::default()
        };
        assert!(TransformParams::from_request(&bad).is_err());
    }

    #[test]
    fn encode_fits_inside_without_upscaling() {
        // 64x32 source image
        let src = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            64,
            32,
            image::Rgba([120, 40, 200, 255]),
        ));
        let mut png = Vec::new();
        src.write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        // Downscale: fits inside 32x32 preserving aspect.
        let params = TransformParams {
            width: Some(32),
            height: Some(32),
            quality: None,
            format: Some(OutputFormat::Png),
        };
        let out = encode(&png, &params, "image/png").unwrap();
        assert_eq!((out.width, out.height), (32, 16));

        // Requesting larger than the original never upscales.
        let params = TransformParams {
            width: Some(2048),
            height: Some(2048),
            quality: None,
            format: Some(OutputFormat::Png),
        };
        let out = encode(&png, &params, "image/png").unwrap();
        assert_eq!((out.width, out.height), (64, 32));
    }

    #[test]
    fn default_format_follows_source_compatibility() {
        let src = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            8,
            8,
            image::Rgba([0, 0, 0, 255]),
        ));
        let mut png = Vec::new();
        src.write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let params = TransformParams {
            width: Some(4),
            height: Some(4),
            quality: None,
            format: None,
        };
        // PNG source stays PNG.
        assert_eq!(
            encode(&png, &params, "image/png").unwrap().format,
            OutputFormat::Png
        );
        // Anything else defaults to WebP.
        assert_eq!(
            encode(&png, &params, "image/gif").unwrap().format,
            OutputFormat::Webp
        );
    }

    #[test]
    fn garbage_bytes_fail_cleanly() {
        let params = TransformParams {
            width: Some(10),
            height: None,
            quality: None,
            format: None,
        };
        assert!(matches!(
            encode(b"not an image", &params, "image/png"),
            Err(TransformError::Failed(_))
        ));
    }
}
