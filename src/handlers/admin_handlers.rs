//! Operational endpoints.

use axum::{Json, extract::State, http::HeaderMap, response::IntoResponse};

use crate::errors::ApiError;
use crate::handlers::caller_id;
use crate::state::AppState;

/// `POST /api/admin/sweep` — run one eviction sweep and return the report.
///
/// Also wired to the `--sweep` CLI mode; both paths call the same job.
pub async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    caller_id(&headers)?;
    let report = state.sweeper.sweep().await.map_err(|err| {
        tracing::error!("sweep failed: {err}");
        ApiError::Unavailable
    })?;
    Ok(Json(report))
}
