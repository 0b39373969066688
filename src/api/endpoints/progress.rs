//! Progress polling. Never blocks on a running job.

use axum::extract::State;
use axum::Json;

use crate::api::types::{ApiContext, LegacyProgress};
use crate::job_tracker::ProgressState;

/// `GET /progress`: full snapshot.
pub async fn progress(State(ctx): State<ApiContext>) -> Json<ProgressState> {
    Json(ctx.orchestrator.tracker().snapshot())
}

/// `GET /ocr_progress`: `{status, progress}` for the original web page.
pub async fn ocr_progress(State(ctx): State<ApiContext>) -> Json<LegacyProgress> {
    let snapshot = ctx.orchestrator.tracker().snapshot();
    Json(LegacyProgress {
        status: snapshot.status,
        progress: snapshot.percent,
    })
}
