//! One-job-at-a-time guard and live progress.
//!
//! `JobTracker` is shared (via `Arc`) between the orchestrator and the HTTP
//! layer. A job holds a `JobGuard` for its entire run. While it is held:
//! - every other `try_begin()` fails immediately with `Busy` (no queueing);
//! - only the guard writes progress.
//!
//! Progress reads take a short read lock on the snapshot and never touch the
//! job lock, so `/progress` answers while a job is running.
//!
//! Percent schedule: Starting 5, Enhancing 10, Recognizing 30 → 80 (scaled by
//! finished engines), Merging 90, Completed 100. Within one job the value never
//! decreases. Failure resets it to 0 and records the error.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::recognition::{EngineId, EngineResult, FanoutObserver};

const PERCENT_STARTING: u8 = 5;
const PERCENT_ENHANCING: u8 = 10;
const PERCENT_RECOGNIZING_START: u8 = 30;
const PERCENT_RECOGNIZING_SPAN: u8 = 50;
const PERCENT_MERGING: u8 = 90;
const PERCENT_COMPLETED: u8 = 100;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Idle,
    Starting,
    Enhancing,
    Recognizing,
    Merging,
    Completed,
    Failed,
}

/// Latest committed progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressState {
    pub job_id: Option<Uuid>,
    pub status: String,
    pub percent: u8,
    pub stage: JobStage,
    /// Engines currently running, sorted by name.
    pub active_engines: Vec<EngineId>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressState {
    fn idle() -> Self {
        Self {
            job_id: None,
            status: "Idle".to_string(),
            percent: 0,
            stage: JobStage::Idle,
            active_engines: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Another OCR job is already running")]
pub struct Busy;

// ═══════════════════════════════════════════════════════════
// JobTracker
// ═══════════════════════════════════════════════════════════

pub struct JobTracker {
    /// Held for the full duration of one job.
    lock: Mutex<()>,
    busy: AtomicBool,
    progress: RwLock<ProgressState>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            busy: AtomicBool::new(false),
            progress: RwLock::new(ProgressState::idle()),
        }
    }

    /// Start a job, or fail immediately if one is running.
    pub fn try_begin(&self) -> Result<JobGuard<'_>, Busy> {
        let lock = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Busy),
            // A previous job panicked while holding the lock; the unit value
            // carries no state, so the lock is still usable.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.busy.store(true, Ordering::SeqCst);

        let job_id = Uuid::new_v4();
        self.write(|p| {
            *p = ProgressState {
                job_id: Some(job_id),
                status: "Starting OCR job".to_string(),
                percent: PERCENT_STARTING,
                stage: JobStage::Starting,
                active_engines: Vec::new(),
                error: None,
                updated_at: Utc::now(),
            };
        });
        debug!(%job_id, "Job lock acquired");

        Ok(JobGuard {
            _lock: lock,
            tracker: self,
            job_id,
            active: RefCell::new(BTreeSet::new()),
            total_engines: Cell::new(0),
            finished_engines: Cell::new(0),
            terminal: Cell::new(false),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Non-blocking (short read lock) copy of the latest progress.
    pub fn snapshot(&self) -> ProgressState {
        match self.progress.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self, update: impl FnOnce(&mut ProgressState)) {
        let mut guard = match self.progress.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
        guard.updated_at = Utc::now();
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// JobGuard: exclusive job token
// ═══════════════════════════════════════════════════════════

/// Exclusive right to run one job and to publish its progress.
///
/// Dropping the guard releases the job lock. A guard dropped before
/// `complete()` or `fail()` (early return, panic) marks the job failed.
pub struct JobGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    tracker: &'a JobTracker,
    job_id: Uuid,
    active: RefCell<BTreeSet<EngineId>>,
    total_engines: Cell<usize>,
    finished_engines: Cell<usize>,
    terminal: Cell<bool>,
}

impl JobGuard<'_> {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn enhancing(&self) {
        self.advance(JobStage::Enhancing, PERCENT_ENHANCING, "Enhancing image".to_string());
    }

    pub fn recognizing(&self, engines: usize) {
        self.total_engines.set(engines);
        self.finished_engines.set(0);
        self.advance(
            JobStage::Recognizing,
            PERCENT_RECOGNIZING_START,
            format!("Running {engines} OCR engine(s)"),
        );
    }

    pub fn merging(&self) {
        self.advance(JobStage::Merging, PERCENT_MERGING, "Merging results".to_string());
    }

    pub fn complete(&self) {
        self.terminal.set(true);
        self.tracker.write(|p| {
            p.stage = JobStage::Completed;
            p.percent = PERCENT_COMPLETED;
            p.status = "OCR Completed".to_string();
            p.active_engines.clear();
            p.error = None;
        });
    }

    pub fn fail(&self, reason: &str) {
        self.terminal.set(true);
        self.tracker.write(|p| {
            p.stage = JobStage::Failed;
            p.percent = 0;
            p.status = format!("Failed: {reason}");
            p.active_engines.clear();
            p.error = Some(reason.to_string());
        });
    }

    fn advance(&self, stage: JobStage, percent: u8, status: String) {
        self.tracker.write(|p| {
            p.stage = stage;
            p.percent = p.percent.max(percent);
            p.status = status;
        });
    }

    fn recognition_percent(&self) -> u8 {
        let total = self.total_engines.get().max(1);
        let done = self.finished_engines.get().min(total);
        PERCENT_RECOGNIZING_START + (PERCENT_RECOGNIZING_SPAN as usize * done / total) as u8
    }

    fn publish_active(&self, status: String) {
        let active: Vec<EngineId> = self.active.borrow().iter().cloned().collect();
        let percent = self.recognition_percent();
        self.tracker.write(|p| {
            p.active_engines = active;
            p.percent = p.percent.max(percent);
            p.status = status;
        });
    }
}

impl FanoutObserver for JobGuard<'_> {
    fn engine_started(&self, engine: &EngineId) {
        self.active.borrow_mut().insert(engine.clone());
        self.publish_active(format!("Running OCR: {engine}"));
    }

    fn engine_finished(&self, result: &EngineResult) {
        self.active.borrow_mut().remove(&result.engine);
        self.finished_engines.set(self.finished_engines.get() + 1);
        let status = match &result.outcome {
            Ok(_) => format!("{} finished", result.engine),
            Err(err) => format!("{} failed: {}", result.engine, err.code()),
        };
        self.publish_active(status);
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.terminal.get() {
            warn!(job_id = %self.job_id, "Job ended without a result");
            self.fail("Job aborted unexpectedly");
        }
        self.tracker.busy.store(false, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::recognition::EngineError;
    use std::sync::Arc;

    fn finished(engine: &str, ok: bool) -> EngineResult {
        EngineResult {
            engine: engine.into(),
            outcome: if ok {
                Ok(vec!["x".into()])
            } else {
                Err(EngineError::Internal("boom".into()))
            },
            elapsed_ms: 0,
        }
    }

    #[test]
    fn new_tracker_is_idle() {
        let tracker = JobTracker::new();
        let snap = tracker.snapshot();
        assert!(!tracker.is_busy());
        assert_eq!(snap.stage, JobStage::Idle);
        assert_eq!(snap.percent, 0);
        assert!(snap.job_id.is_none());
    }

    #[test]
    fn second_begin_is_rejected_while_held() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin().unwrap();
        assert!(tracker.is_busy());
        assert_eq!(tracker.try_begin().err(), Some(Busy));

        guard.complete();
        drop(guard);
        assert!(!tracker.is_busy());
        assert!(tracker.try_begin().is_ok());
    }

    #[test]
    fn begin_resets_previous_job() {
        let tracker = JobTracker::new();
        {
            let guard = tracker.try_begin().unwrap();
            guard.fail("earlier failure");
        }
        let guard = tracker.try_begin().unwrap();
        let snap = tracker.snapshot();
        assert_eq!(snap.stage, JobStage::Starting);
        assert_eq!(snap.percent, 5);
        assert!(snap.error.is_none());
        assert_eq!(snap.job_id, Some(guard.job_id()));
        guard.complete();
    }

    #[test]
    fn stages_follow_percent_schedule() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin().unwrap();

        guard.enhancing();
        assert_eq!(tracker.snapshot().percent, 10);

        guard.recognizing(2);
        assert_eq!(tracker.snapshot().percent, 30);

        guard.engine_started(&"a".into());
        guard.engine_started(&"b".into());
        let snap = tracker.snapshot();
        assert_eq!(snap.active_engines, vec![EngineId::new("a"), EngineId::new("b")]);

        guard.engine_finished(&finished("a", true));
        let snap = tracker.snapshot();
        assert_eq!(snap.percent, 55);
        assert_eq!(snap.active_engines, vec![EngineId::new("b")]);

        guard.engine_finished(&finished("b", false));
        assert_eq!(tracker.snapshot().percent, 80);
        assert!(tracker.snapshot().status.contains("engine_internal_error"));

        guard.merging();
        assert_eq!(tracker.snapshot().percent, 90);

        guard.complete();
        let snap = tracker.snapshot();
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.stage, JobStage::Completed);
        assert_eq!(snap.status, "OCR Completed");
    }

    #[test]
    fn percent_never_moves_backwards() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin().unwrap();
        guard.merging();
        guard.enhancing();
        assert_eq!(tracker.snapshot().percent, 90);
        guard.complete();
    }

    #[test]
    fn fail_resets_percent_and_records_error() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin().unwrap();
        guard.enhancing();
        guard.fail("Unreadable image");

        let snap = tracker.snapshot();
        assert_eq!(snap.stage, JobStage::Failed);
        assert_eq!(snap.percent, 0);
        assert_eq!(snap.error.as_deref(), Some("Unreadable image"));
    }

    #[test]
    fn dropped_guard_marks_job_failed_and_releases_lock() {
        let tracker = JobTracker::new();
        {
            let guard = tracker.try_begin().unwrap();
            guard.recognizing(3);
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.stage, JobStage::Failed);
        assert_eq!(snap.percent, 0);
        assert!(snap.error.is_some());
        assert!(!tracker.is_busy());
    }

    #[test]
    fn panic_inside_job_releases_lock() {
        let tracker = Arc::new(JobTracker::new());
        let t = Arc::clone(&tracker);
        let handle = std::thread::spawn(move || {
            let _guard = t.try_begin().unwrap();
            panic!("stage exploded");
        });
        assert!(handle.join().is_err());

        assert!(!tracker.is_busy());
        assert_eq!(tracker.snapshot().stage, JobStage::Failed);
        let guard = tracker.try_begin().expect("lock usable after panic");
        guard.complete();
    }

    #[test]
    fn other_thread_is_rejected_not_blocked() {
        let tracker = Arc::new(JobTracker::new());
        let guard = tracker.try_begin().unwrap();

        let t = Arc::clone(&tracker);
        let handle = std::thread::spawn(move || t.try_begin().map(|_| ()).err());
        assert_eq!(handle.join().unwrap(), Some(Busy));

        // Snapshot readable from another thread while held
        let t = Arc::clone(&tracker);
        let stage = std::thread::spawn(move || t.snapshot().stage).join().unwrap();
        assert_eq!(stage, JobStage::Starting);

        guard.complete();
    }

    #[test]
    fn progress_serializes_snake_case_stage() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin().unwrap();
        guard.recognizing(1);
        guard.engine_started(&"tesseract".into());

        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["stage"], "recognizing");
        assert_eq!(json["active_engines"][0], "tesseract");
        assert_eq!(json["percent"], 30);
        guard.complete();
    }
}
