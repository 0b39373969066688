//! OCR HTTP router.
//!
//! Routes:
//! - `POST /recognize`, `POST /crop_ocr` (legacy alias)
//! - `GET /progress`, `GET /ocr_progress` (legacy shape)
//! - `GET /health`
//!
//! Layers (outermost first): trace → CORS → body limit.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;

/// Headroom for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn ocr_router(ctx: ApiContext) -> Router {
    let body_limit = ctx.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/recognize", post(endpoints::recognize::recognize))
        .route("/crop_ocr", post(endpoints::recognize::recognize))
        .route("/progress", get(endpoints::progress::progress))
        .route("/ocr_progress", get(endpoints::progress::ocr_progress))
        .route("/health", get(endpoints::health::check))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
