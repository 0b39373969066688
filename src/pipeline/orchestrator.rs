//! One OCR job end to end: enhance → fan out to engines → merge.
//!
//! `run()` is synchronous and holds the job lock for its whole duration.
//! `run_async()` moves it onto tokio's blocking pool so HTTP handlers can
//! keep serving `/progress` while it executes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use super::merge::{MergedText, ResultMerger};
use super::preprocess::{ImageEnhancer, ImagePipeline};
use super::recognition::{build_engines, EngineId, FanoutResults, LanguageHints, RecognitionFanout, Recognizer};
use super::JobError;
use crate::config::ServiceConfig;
use crate::job_tracker::{JobStage, JobTracker};

/// A finished job. Discarded once the caller has built its response.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub enhanced_path: PathBuf,
    pub stage: JobStage,
    /// One slot per configured engine, in configuration order.
    pub engine_results: FanoutResults,
    pub merged: MergedText,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct OcrOrchestrator {
    enhancer: Box<dyn ImageEnhancer>,
    engines: Vec<Arc<dyn Recognizer>>,
    fanout: RecognitionFanout,
    merger: ResultMerger,
    hints: LanguageHints,
    tracker: Arc<JobTracker>,
}

impl OcrOrchestrator {
    pub fn new(
        enhancer: Box<dyn ImageEnhancer>,
        engines: Vec<Arc<dyn Recognizer>>,
        fanout: RecognitionFanout,
        merger: ResultMerger,
        hints: LanguageHints,
        tracker: Arc<JobTracker>,
    ) -> Self {
        Self {
            enhancer,
            engines,
            fanout,
            merger,
            hints,
            tracker,
        }
    }

    /// Wire the production pipeline from configuration.
    pub fn from_config(config: &ServiceConfig, tracker: Arc<JobTracker>) -> Self {
        let enhancer = ImagePipeline::new(config.enhancement.clone(), config.enhanced_path());
        let engines = build_engines(&config.engines, config.engine_timeout());
        let fanout = RecognitionFanout::new(config.engine_timeout())
            .with_max_parallel(config.max_parallel_engines);

        Self::new(
            Box::new(enhancer),
            engines,
            fanout,
            ResultMerger::new(config.merge_policy),
            LanguageHints::new(config.language_hints.iter().cloned()),
            tracker,
        )
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn engine_ids(&self) -> Vec<EngineId> {
        self.engines.iter().map(|e| e.id().clone()).collect()
    }

    pub fn is_busy(&self) -> bool {
        self.tracker.is_busy()
    }

    /// Run one job on `source`. Fails with `Busy` if another job holds the lock.
    pub fn run(&self, source: &Path) -> Result<Job, JobError> {
        if self.engines.is_empty() {
            return Err(JobError::NoEngines);
        }

        let guard = self.tracker.try_begin().map_err(|_| {
            info!(source = %source.display(), "Rejecting OCR job: another job is running");
            JobError::Busy
        })?;

        let span = info_span!("ocr_job", job_id = %guard.job_id());
        let _enter = span.enter();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(source = %source.display(), engines = self.engines.len(), "OCR job started");

        guard.enhancing();
        let enhanced_path = match self.enhancer.enhance(source) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Enhancement failed");
                guard.fail(&e.to_string());
                return Err(e.into());
            }
        };

        guard.recognizing(self.engines.len());
        let engine_results = self
            .fanout
            .run_all(&enhanced_path, &self.engines, &self.hints, &guard);

        guard.merging();
        let merged = match self.merger.select(&engine_results) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(engines = engine_results.len(), succeeded = engine_results.succeeded(), "No text detected");
                guard.fail("No text detected");
                return Err(e.into());
            }
        };

        guard.complete();
        info!(
            lines = merged.lines.len(),
            selected_engine = merged.selected_engine.as_ref().map(EngineId::as_str).unwrap_or("-"),
            policy = %merged.policy,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "OCR job completed"
        );

        Ok(Job {
            id: guard.job_id(),
            source_path: source.to_path_buf(),
            enhanced_path,
            stage: JobStage::Completed,
            engine_results,
            merged,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// `run()` on the blocking thread pool.
    pub fn run_async(self: &Arc<Self>, source: PathBuf) -> tokio::task::JoinHandle<Result<Job, JobError>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.run(&source))
    }
}
