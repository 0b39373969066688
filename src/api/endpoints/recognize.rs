//! `POST /recognize` (and the legacy `POST /crop_ocr`).

use axum::extract::{Multipart, State};
use axum::Json;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, EngineReport, RecognizeResponse};
use crate::api::upload::{is_supported_image, StagedUpload};
use crate::pipeline::{Job, JobError};

/// Multipart field names accepted for the image.
const FILE_FIELDS: &[&str] = &["image", "file"];

/// Run one OCR job on the uploaded image and wait for its result.
///
/// An image without text is still a 200, rendered by `ApiError::NoText`.
pub async fn recognize(
    State(ctx): State<ApiContext>,
    mut multipart: Multipart,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let (filename, bytes) = read_image_field(&mut multipart, ctx.max_upload_bytes)
        .await?
        .ok_or_else(|| ApiError::BadRequest("No image uploaded".into()))?;

    if !is_supported_image(&filename) {
        return Err(ApiError::UnsupportedMedia(format!(
            "Unsupported file type: {filename}. Use PNG, JPEG, TIFF or BMP."
        )));
    }

    // Fast rejection; `run` re-checks under the lock.
    if ctx.orchestrator.is_busy() {
        info!(filename = %filename, "Upload rejected: OCR already in progress");
        return Err(JobError::Busy.into());
    }

    let staged = StagedUpload::write(&ctx.upload_dir, &filename, &bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to store upload: {e}")))?;
    info!(filename = %filename, size = bytes.len(), "Image uploaded");

    let outcome = ctx
        .orchestrator
        .run_async(staged.path().to_path_buf())
        .await
        .map_err(|e| JobError::Worker(e.to_string()))?;
    drop(staged);

    let job = outcome?;
    Ok(Json(completed(&job)))
}

fn completed(job: &Job) -> RecognizeResponse {
    RecognizeResponse {
        message: "OCR Completed",
        text: job.merged.text.clone(),
        selected_engine: job.merged.selected_engine.clone(),
        policy: Some(job.merged.policy),
        engines: job.engine_results.iter().map(EngineReport::from).collect(),
        no_text: false,
    }
}

/// First `image`/`file` field as `(filename, bytes)`. Other fields are skipped.
async fn read_image_field(
    multipart: &mut Multipart,
    max_bytes: usize,
) -> Result<Option<(String, Vec<u8>)>, ApiError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Malformed multipart body: {e}");
                return Err(ApiError::BadRequest("Malformed multipart body".into()));
            }
        };

        let name = field.name().unwrap_or("").to_string();
        if !FILE_FIELDS.contains(&name.as_str()) {
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        let bytes = field.bytes().await.map_err(|e| {
            warn!("Failed to read upload bytes: {e}");
            ApiError::BadRequest("Failed to read file data".into())
        })?;

        if filename.is_empty() || bytes.is_empty() {
            return Ok(None);
        }
        if bytes.len() > max_bytes {
            return Err(ApiError::PayloadTooLarge { limit_bytes: max_bytes });
        }
        return Ok(Some((filename, bytes.to_vec())));
    }
}
