use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::identify::{IdentifyRequest, IdentifyResponse};
use crate::models::job::{JobState, JobStatusView};
use crate::queue::codec::JobPayload;

/// POST /api/v1/identify — Upload an image for asynchronous identification.
pub async fn submit_identification(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<IdentifyResponse>), StatusCode> {
    let mut image: Option<(Vec<u8>, String, String)> = None;
    let mut meta = IdentifyRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        match field.name() {
            Some("image") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let declared_mime = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;

                // Validate image format using the `image` crate
                let format = image::guess_format(&data)
                    .map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;
                let mime_type =
                    declared_mime.unwrap_or_else(|| format.to_mime_type().to_string());

                image = Some((data.to_vec(), mime_type, file_name));
            }
            Some("user_id") => {
                meta.user_id = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }

    let (image_bytes, mime_type, original_file_name) = image.ok_or(StatusCode::BAD_REQUEST)?;
    meta.validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let payload = JobPayload {
        image_bytes,
        mime_type,
        original_file_name,
        user_id: meta.user_id,
    };

    let job_id = state.producer.enqueue(&payload).await.map_err(|e| {
        tracing::error!(error = %e, "Enqueue failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IdentifyResponse {
            job_id,
            state: JobState::Waiting.to_string(),
            message: "Image submitted for identification".to_string(),
        }),
    ))
}

/// GET /api/v1/identify/{job_id} — Poll identification job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, StatusCode> {
    match state.status.get_status(&job_id).await {
        Ok(Some(view)) => Ok(Json(view)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Status read failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
