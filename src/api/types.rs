//! Shared state and response shapes for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ServiceConfig;
use crate::job_tracker::JobTracker;
use crate::pipeline::recognition::{EngineError, EngineId, EngineResult};
use crate::pipeline::{MergePolicy, OcrOrchestrator};

/// Shared context for all routes. Cheap to clone.
#[derive(Clone)]
pub struct ApiContext {
    pub orchestrator: Arc<OcrOrchestrator>,
    /// Where uploads are staged while a job runs.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl ApiContext {
    pub fn new(orchestrator: Arc<OcrOrchestrator>, upload_dir: PathBuf, max_upload_bytes: usize) -> Self {
        Self {
            orchestrator,
            upload_dir,
            max_upload_bytes,
        }
    }

    /// Build the production orchestrator and its tracker from configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let tracker = Arc::new(JobTracker::new());
        let orchestrator = Arc::new(OcrOrchestrator::from_config(config, tracker));
        Self::new(orchestrator, config.work_dir.clone(), config.max_upload_bytes)
    }
}

// ═══════════════════════════════════════════════════════════
// Response bodies
// ═══════════════════════════════════════════════════════════

/// Text returned when every engine came back empty.
pub const NO_TEXT_MESSAGE: &str = "No text detected. Try enhancing the image.";

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub message: &'static str,
    pub text: String,
    pub selected_engine: Option<EngineId>,
    pub policy: Option<MergePolicy>,
    pub engines: Vec<EngineReport>,
    pub no_text: bool,
}

impl RecognizeResponse {
    /// Successful request whose image held no readable text.
    pub fn no_text() -> Self {
        Self {
            message: "OCR Completed",
            text: NO_TEXT_MESSAGE.to_string(),
            selected_engine: None,
            policy: None,
            engines: Vec::new(),
            no_text: true,
        }
    }
}

/// One engine's slot as reported to the client.
#[derive(Debug, Serialize)]
pub struct EngineReport {
    pub engine: EngineId,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    pub elapsed_ms: u64,
}

impl From<&EngineResult> for EngineReport {
    fn from(slot: &EngineResult) -> Self {
        match &slot.outcome {
            Ok(lines) => Self {
                engine: slot.engine.clone(),
                status: "ok",
                lines: Some(lines.len()),
                error: None,
                elapsed_ms: slot.elapsed_ms,
            },
            Err(err) => Self {
                engine: slot.engine.clone(),
                status: err.code(),
                lines: None,
                error: Some(err.clone()),
                elapsed_ms: slot.elapsed_ms,
            },
        }
    }
}

/// `GET /ocr_progress` body kept for the original web client.
#[derive(Debug, Serialize)]
pub struct LegacyProgress {
    pub status: String,
    pub progress: u8,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub engines: Vec<EngineId>,
    pub busy: bool,
}
