use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

use super::{job_view, ApiError};
use crate::jobs::types::{Artifact, InputDescriptor, JobError};
use crate::jobs::NewJob;
use crate::utils::http::extension_from_name;
use crate::utils::srt::UTF8_BOM;
use crate::AppContext;

pub fn jobs_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/:job_id", get(get_job))
        .route("/:job_id/artifacts/:name", get(download_artifact))
        .with_state(ctx)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobBody {
    #[serde(rename = "type", default)]
    job_type: Option<String>,
    audio_path: Option<PathBuf>,
    audio_url: Option<String>,
    vad_max_single_segment_ms: Option<i64>,
    vad_max_end_silence_ms: Option<i64>,
}

/// `POST /v2/jobs`: multipart upload or JSON `audioPath`/`audioUrl`.
async fn create_job(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
) -> Result<impl IntoResponse, ApiError> {
    let (body, upload) = decode_create_request(&ctx, req).await?;

    let spool = upload.as_ref().map(|(path, _)| path.clone());
    let input = match upload {
        Some((spool_path, file_name)) => InputDescriptor::Upload { spool_path, file_name },
        None => match (body.audio_path, body.audio_url) {
            (Some(path), _) => InputDescriptor::AudioPath { path },
            (None, Some(url)) => InputDescriptor::AudioUrl { url },
            (None, None) => return Err(JobError::bad_request("missing audio input").into()),
        },
    };

    let created = ctx
        .manager
        .create_job(NewJob {
            job_type: body.job_type.unwrap_or_default(),
            input,
            vad_max_single_segment_ms: body.vad_max_single_segment_ms,
            vad_max_end_silence_ms: body.vad_max_end_silence_ms,
        })
        .await;
    let job = match created {
        Ok(job) => job,
        Err(e) => {
            // rejected before the spool was claimed; don't leak it
            if let Some(spool) = spool {
                let _ = tokio::fs::remove_file(spool).await;
            }
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"jobId": job.id, "statusUrl": format!("/v2/jobs/{}", job.id)})),
    ))
}

async fn get_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = ctx
        .manager
        .get_job(&job_id)
        .await
        .ok_or_else(|| JobError::not_found(format!("job not found: {job_id}")))?;
    Ok(Json(job_view(&job, ctx.manager.queue_counts())))
}

async fn download_artifact(
    State(ctx): State<Arc<AppContext>>,
    Path((job_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let job = ctx
        .manager
        .get_job(&job_id)
        .await
        .ok_or_else(|| JobError::not_found(format!("job not found: {job_id}")))?;
    let artifact = job
        .artifacts
        .get(&name)
        .or_else(|| job.artifacts.values().find(|a| a.name == name))
        .ok_or_else(|| JobError::not_found("Artifact not found (or not ready yet)"))?;
    serve_artifact(artifact).await
}

/// Stream an artifact to the client. SRT downloads get a UTF-8 BOM so
/// desktop subtitle players detect the encoding.
pub(crate) async fn serve_artifact(artifact: &Artifact) -> Result<Response, ApiError> {
    if !artifact.ready || !artifact.path.is_file() {
        return Err(JobError::not_found("Artifact not found (or not ready yet)").into());
    }

    let disposition = format!("attachment; filename=\"{}\"", artifact.name);
    if artifact.name.ends_with(".srt") {
        let mut data = tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| JobError::internal(format!("failed to read artifact: {e}")))?;
        if !data.starts_with(UTF8_BOM) {
            let mut with_bom = Vec::with_capacity(UTF8_BOM.len() + data.len());
            with_bom.extend_from_slice(UTF8_BOM);
            with_bom.append(&mut data);
            data = with_bom;
        }
        return Ok((
            [
                (header::CONTENT_TYPE, "application/x-subrip; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            data,
        )
            .into_response());
    }

    let content_type = match artifact.path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("zip") => "application/zip",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    };
    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|e| JobError::internal(format!("failed to open artifact: {e}")))?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Decode either encoding of a job-creation request. Multipart fields mirror
/// the JSON body; the file part (if any) is spooled under `uploads/`.
async fn decode_create_request(
    ctx: &Arc<AppContext>,
    req: Request,
) -> Result<(CreateJobBody, Option<(PathBuf, Option<String>)>), ApiError> {
    if !is_multipart(&req) {
        let bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
            .await
            .map_err(|e| JobError::bad_request(format!("unreadable request body: {e}")))?;
        if bytes.is_empty() {
            return Ok((CreateJobBody::default(), None));
        }
        let body: CreateJobBody = serde_json::from_slice(&bytes)
            .map_err(|e| JobError::bad_request(format!("invalid JSON body: {e}")))?;
        return Ok((body, None));
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| JobError::bad_request(format!("invalid multipart body: {e}")))?;

    let mut body = CreateJobBody::default();
    let mut upload = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| JobError::bad_request(format!("broken multipart stream: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let spool = spool_upload(ctx, &mut field, file_name.as_deref()).await?;
                upload = Some((spool, file_name));
            }
            "type" => body.job_type = Some(read_text(field).await?),
            "audioPath" => body.audio_path = Some(PathBuf::from(read_text(field).await?)),
            "audioUrl" => body.audio_url = Some(read_text(field).await?),
            "vadMaxSingleSegmentMs" => {
                body.vad_max_single_segment_ms =
                    Some(read_int(field, "vadMaxSingleSegmentMs").await?)
            }
            "vadMaxEndSilenceMs" => {
                body.vad_max_end_silence_ms =
                    Some(read_int(field, "vadMaxEndSilenceMs").await?)
            }
            other => warn!("ignoring unknown multipart field: {other}"),
        }
    }
    Ok((body, upload))
}

pub(crate) fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false)
}

/// Stream one multipart file field into the upload spool.
pub(crate) async fn spool_upload(
    ctx: &Arc<AppContext>,
    field: &mut axum::extract::multipart::Field<'_>,
    file_name: Option<&str>,
) -> Result<PathBuf, ApiError> {
    let ext = file_name.and_then(extension_from_name).unwrap_or_else(|| "bin".to_string());
    let spool = ctx.config.uploads_dir().join(format!("upload-{}.{ext}", Uuid::new_v4().simple()));
    let mut file = tokio::fs::File::create(&spool)
        .await
        .map_err(|e| JobError::internal(format!("failed to create upload spool: {e}")))?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| JobError::bad_request(format!("upload interrupted: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| JobError::internal(format!("failed to write upload: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| JobError::internal(format!("failed to flush upload: {e}")))?;
    Ok(spool)
}

pub(crate) async fn read_text(
    field: axum::extract::multipart::Field<'_>,
) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| JobError::bad_request(format!("unreadable field: {e}")).into())
}

pub(crate) async fn read_int(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<i64, ApiError> {
    let raw = read_text(field).await?;
    raw.trim()
        .parse()
        .map_err(|_| JobError::bad_request(format!("{name} must be an integer, got {raw:?}")).into())
}
