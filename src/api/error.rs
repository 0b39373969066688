//! HTTP error mapping with structured JSON bodies: `{ "error": <message>, "code": <CODE> }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::api::types::RecognizeResponse;
use crate::pipeline::{EnhanceError, JobError};

/// Seconds a client should wait before retrying a busy rejection.
pub const BUSY_RETRY_AFTER_SECS: u64 = 2;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),
    #[error("Upload too large")]
    PayloadTooLarge { limit_bytes: usize },
    #[error("OCR already in progress")]
    Busy { retry_after: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
    /// Not a failure: renders the 200 no-text body.
    #[error("No text detected")]
    NoText,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NoText => return Json(RecognizeResponse::no_text()).into_response(),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail.clone()),
            ApiError::UnsupportedMedia(detail) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                detail.clone(),
            ),
            ApiError::PayloadTooLarge { limit_bytes } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("Image too large. Maximum {}MB.", limit_bytes / (1024 * 1024)),
            ),
            ApiError::Busy { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "BUSY",
                format!("OCR already in progress. Retry after {retry_after}s"),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut response = (status, Json(ErrorBody { error: message, code })).into_response();
        if let ApiError::Busy { retry_after } = &self {
            if let Ok(val) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, val);
            }
        }
        response
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Busy => ApiError::Busy {
                retry_after: BUSY_RETRY_AFTER_SECS,
            },
            JobError::Enhance(EnhanceError::UnreadableImage { .. }) => {
                ApiError::BadRequest("Uploaded file is not a readable image".into())
            }
            JobError::Enhance(e @ EnhanceError::WriteFailure { .. }) => ApiError::Internal(e.to_string()),
            JobError::NoTextDetected => ApiError::NoText,
            e @ (JobError::NoEngines | JobError::Worker(_)) => ApiError::Internal(e.to_string()),
        }
    }
}
