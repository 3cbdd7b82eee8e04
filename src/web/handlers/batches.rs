use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::jobs::{is_multipart, read_text, serve_artifact, spool_upload};
use super::{batch_view, ApiError};
use crate::jobs::types::{BatchTasks, InputDescriptor, JobError};
use crate::jobs::NewBatch;
use crate::AppContext;

pub fn batches_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", post(create_batch))
        .route("/:batch_id", get(get_batch))
        .route("/:batch_id/cancel", post(cancel_batch))
        .route("/:batch_id/items/:idx/artifacts/:name", get(download_item_artifact))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchBody {
    #[serde(default)]
    tasks: Option<BatchTasks>,
    #[serde(default)]
    policy: Option<String>,
    #[serde(default)]
    items: Vec<BatchItemBody>,
    vad_max_single_segment_ms: Option<i64>,
    vad_max_end_silence_ms: Option<i64>,
}

/// One requested item. Uploads reference a multipart file part by its field
/// name, so the `items` array fully determines processing order.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum BatchItemBody {
    #[serde(rename_all = "camelCase")]
    Upload { field: String },
    #[serde(rename_all = "camelCase")]
    AudioPath { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    AudioUrl { url: String },
}

/// `POST /v2/batches`: JSON body, or multipart with an `options` JSON part
/// plus one file part per upload item.
async fn create_batch(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
) -> Result<impl IntoResponse, ApiError> {
    let (body, mut uploads) = decode_batch_request(&ctx, req).await?;

    let mut items = Vec::with_capacity(body.items.len());
    for item in body.items {
        items.push(match item {
            BatchItemBody::Upload { field } => {
                let (spool_path, file_name) = uploads.remove(&field).ok_or_else(|| {
                    JobError::bad_request(format!("no uploaded file part named {field:?}"))
                })?;
                InputDescriptor::Upload { spool_path, file_name }
            }
            BatchItemBody::AudioPath { path } => InputDescriptor::AudioPath { path },
            BatchItemBody::AudioUrl { url } => InputDescriptor::AudioUrl { url },
        });
    }

    // anything not referenced by an item stays out of the pipeline
    for (spool, _) in uploads.into_values() {
        let _ = tokio::fs::remove_file(spool).await;
    }

    let spools: Vec<PathBuf> = items
        .iter()
        .filter_map(|i| match i {
            InputDescriptor::Upload { spool_path, .. } => Some(spool_path.clone()),
            _ => None,
        })
        .collect();
    let created = ctx
        .manager
        .create_batch(NewBatch {
            tasks: body.tasks.unwrap_or(BatchTasks { asr: true, demucs: false }),
            policy: body.policy,
            items,
            vad_max_single_segment_ms: body.vad_max_single_segment_ms,
            vad_max_end_silence_ms: body.vad_max_end_silence_ms,
        })
        .await;
    let batch = match created {
        Ok(batch) => batch,
        Err(e) => {
            for spool in spools {
                let _ = tokio::fs::remove_file(spool).await;
            }
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"batchId": batch.id, "statusUrl": format!("/v2/batches/{}", batch.id)})),
    ))
}

async fn get_batch(
    State(ctx): State<Arc<AppContext>>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let batch = ctx
        .manager
        .get_batch(&batch_id)
        .await
        .ok_or_else(|| JobError::not_found(format!("batch not found: {batch_id}")))?;
    Ok(Json(batch_view(&batch)))
}

/// Cooperative cancel: terminal batches are a no-op returning current state.
async fn cancel_batch(
    State(ctx): State<Arc<AppContext>>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let batch = ctx.manager.cancel_batch(&batch_id).await?;
    Ok(Json(batch_view(&batch)))
}

async fn download_item_artifact(
    State(ctx): State<Arc<AppContext>>,
    Path((batch_id, idx, name)): Path<(String, usize, String)>,
) -> Result<Response, ApiError> {
    let batch = ctx
        .manager
        .get_batch(&batch_id)
        .await
        .ok_or_else(|| JobError::not_found(format!("batch not found: {batch_id}")))?;
    let item = batch
        .items
        .get(idx)
        .ok_or_else(|| JobError::not_found(format!("batch item not found: {idx}")))?;
    let artifact = item
        .artifacts
        .get(&name)
        .or_else(|| item.artifacts.values().find(|a| a.name == name))
        .ok_or_else(|| JobError::not_found("Artifact not found (or not ready yet)"))?;
    serve_artifact(artifact).await
}

type Uploads = std::collections::HashMap<String, (PathBuf, Option<String>)>;

async fn decode_batch_request(
    ctx: &Arc<AppContext>,
    req: Request,
) -> Result<(CreateBatchBody, Uploads), ApiError> {
    if !is_multipart(&req) {
        let bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
            .await
            .map_err(|e| JobError::bad_request(format!("unreadable request body: {e}")))?;
        let body: CreateBatchBody = serde_json::from_slice(&bytes)
            .map_err(|e| JobError::bad_request(format!("invalid JSON body: {e}")))?;
        return Ok((body, Uploads::new()));
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| JobError::bad_request(format!("invalid multipart body: {e}")))?;

    let mut body: Option<CreateBatchBody> = None;
    let mut uploads = Uploads::new();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| JobError::bad_request(format!("broken multipart stream: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "options" {
            let raw = read_text(field).await?;
            body = Some(
                serde_json::from_str(&raw)
                    .map_err(|e| JobError::bad_request(format!("invalid options JSON: {e}")))?,
            );
        } else {
            let file_name = field.file_name().map(str::to_string);
            let spool = spool_upload(ctx, &mut field, file_name.as_deref()).await?;
            uploads.insert(name, (spool, file_name));
        }
    }

    let body = body.ok_or_else(|| JobError::bad_request("missing options part"))?;
    Ok((body, uploads))
}
