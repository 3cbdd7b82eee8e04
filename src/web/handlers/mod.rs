use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::jobs::types::{Batch, ErrorCode, Job, JobError};
use crate::queue::QueueCounts;
use crate::AppContext;

pub mod batches;
pub mod jobs;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .nest("/v2/jobs", jobs::jobs_router(ctx.clone()))
        .nest("/v2/batches", batches::batches_router(ctx.clone()))
        .layer(axum::middleware::from_fn_with_state(ctx.clone(), require_bearer));

    Router::new().route("/healthz", get(health)).merge(api)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Static bearer token check. Policy lives outside the orchestrator; when no
/// token is configured every request passes.
async fn require_bearer(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = ctx.config.api_token.as_deref() else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(ApiError(JobError::unauthorized("invalid or missing bearer token")))
    }
}

/// Error envelope: `{status:"error", error:{code, message, details?}}` with
/// the standard HTTP status mapping for each code.
#[derive(Debug)]
pub struct ApiError(pub JobError);

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::BadAudio => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::EngineError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"status": "error", "error": self.0}))).into_response()
    }
}

/// Job snapshot as clients see it: artifact URLs only once ready, plus the
/// live queue counters.
pub(crate) fn job_view(job: &Job, queue: QueueCounts) -> Value {
    let mut view = serde_json::to_value(job).unwrap_or_else(|_| json!({}));
    view["queue"] = json!(queue);
    if let Some(artifacts) = view["artifacts"].as_object_mut() {
        for (key, artifact) in artifacts.iter_mut() {
            if artifact["ready"] == json!(true) {
                artifact["url"] = json!(format!("/v2/jobs/{}/artifacts/{key}", job.id));
            }
        }
    }
    view
}

pub(crate) fn batch_view(batch: &Batch) -> Value {
    let mut view = serde_json::to_value(batch).unwrap_or_else(|_| json!({}));
    view["counts"] = json!(batch.counts());
    if let Some(items) = view["items"].as_array_mut() {
        for (idx, item) in items.iter_mut().enumerate() {
            if let Some(artifacts) = item["artifacts"].as_object_mut() {
                for (key, artifact) in artifacts.iter_mut() {
                    if artifact["ready"] == json!(true) {
                        artifact["url"] = json!(format!(
                            "/v2/batches/{}/items/{idx}/artifacts/{key}",
                            batch.id
                        ));
                    }
                }
            }
        }
    }
    view
}
