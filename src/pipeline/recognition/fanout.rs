//! Concurrent recognition across engines.
//!
//! Each engine runs on its own detached worker thread and reports back over
//! a channel. The caller waits until every engine has either answered or hit
//! its deadline. A timed-out engine is abandoned: its slot is recorded as
//! `Timeout` and whatever it returns later is dropped. A panicking engine is
//! recorded as `Internal`. Slots always come back in configuration order.
//!
//! An abandoned engine stays claimed until its worker actually returns. A
//! later run skips it as `Unavailable` instead of starting a second call on
//! the same engine and the same enhanced image.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::types::{EngineError, EngineId, EngineResult, FanoutResults, LanguageHints, Recognizer};

/// Receives engine lifecycle events. Called on the fanout caller's thread.
pub trait FanoutObserver {
    fn engine_started(&self, _engine: &EngineId) {}
    fn engine_finished(&self, _result: &EngineResult) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl FanoutObserver for NoopObserver {}

type WorkerMessage = (usize, Result<Vec<String>, EngineError>, u64);

/// Engines whose worker is still inside `read`, shared across runs.
#[derive(Default)]
struct InFlight(Arc<Mutex<HashSet<EngineId>>>);

impl InFlight {
    fn claim(&self, engine: &EngineId) -> Option<InFlightClaim> {
        let mut active = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(engine.clone()) {
            return None;
        }
        Some(InFlightClaim {
            active: Arc::clone(&self.0),
            engine: engine.clone(),
        })
    }
}

/// Released when the worker that holds it finishes.
struct InFlightClaim {
    active: Arc<Mutex<HashSet<EngineId>>>,
    engine: EngineId,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.engine);
    }
}

pub struct RecognitionFanout {
    timeout: Duration,
    max_parallel: Option<usize>,
    in_flight: InFlight,
}

impl RecognitionFanout {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_parallel: None,
            in_flight: InFlight::default(),
        }
    }

    /// Cap the number of engines running at once. `None` runs all together.
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Run every engine on `image` and collect one slot per engine.
    pub fn run_all(
        &self,
        image: &Path,
        engines: &[Arc<dyn Recognizer>],
        hints: &LanguageHints,
        observer: &dyn FanoutObserver,
    ) -> FanoutResults {
        let total = engines.len();
        if total == 0 {
            return FanoutResults::default();
        }

        let width = self.max_parallel.unwrap_or(total).clamp(1, total);
        let (tx, rx) = mpsc::channel::<WorkerMessage>();

        let mut slots: Vec<Option<EngineResult>> = (0..total).map(|_| None).collect();
        let mut deadlines: Vec<Option<Instant>> = vec![None; total];
        let mut pending: VecDeque<usize> = (0..total).collect();
        let mut running = 0usize;

        let started = Instant::now();
        info!(engines = total, parallel = width, timeout_ms = self.timeout.as_millis() as u64, "Recognition fanout started");

        loop {
            // Fill free worker slots from the queue
            while running < width {
                let Some(index) = pending.pop_front() else { break };
                let engine = &engines[index];
                observer.engine_started(engine.id());

                let Some(claim) = self.in_flight.claim(engine.id()) else {
                    warn!(engine = %engine.id(), "Engine still busy with an abandoned call, skipping");
                    let result = EngineResult {
                        engine: engine.id().clone(),
                        outcome: Err(EngineError::Unavailable(
                            "still running from a previous job".into(),
                        )),
                        elapsed_ms: 0,
                    };
                    observer.engine_finished(&result);
                    slots[index] = Some(result);
                    continue;
                };

                match spawn_worker(index, Arc::clone(engine), image, hints, claim, tx.clone()) {
                    Ok(()) => {
                        deadlines[index] = Some(Instant::now() + self.timeout);
                        running += 1;
                    }
                    Err(err) => {
                        let result = EngineResult {
                            engine: engine.id().clone(),
                            outcome: Err(EngineError::Internal(format!("failed to spawn worker: {err}"))),
                            elapsed_ms: 0,
                        };
                        observer.engine_finished(&result);
                        slots[index] = Some(result);
                    }
                }
            }

            if running == 0 {
                break;
            }

            let now = Instant::now();
            let next_deadline = deadlines.iter().flatten().min().copied().unwrap_or(now);

            match rx.recv_timeout(next_deadline.saturating_duration_since(now)) {
                Ok((index, outcome, elapsed_ms)) => {
                    if deadlines[index].take().is_none() {
                        debug!(engine = %engines[index].id(), "Discarding late engine result");
                        continue;
                    }
                    running -= 1;
                    let result = EngineResult {
                        engine: engines[index].id().clone(),
                        outcome,
                        elapsed_ms,
                    };
                    log_outcome(&result);
                    observer.engine_finished(&result);
                    slots[index] = Some(result);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    for index in 0..total {
                        if !matches!(deadlines[index], Some(d) if d <= now) {
                            continue;
                        }
                        deadlines[index] = None;
                        running -= 1;
                        warn!(
                            engine = %engines[index].id(),
                            timeout_ms = self.timeout.as_millis() as u64,
                            "Engine exceeded its timeout, abandoning"
                        );
                        let result = EngineResult {
                            engine: engines[index].id().clone(),
                            outcome: Err(EngineError::Timeout {
                                timeout_ms: self.timeout.as_millis() as u64,
                            }),
                            elapsed_ms: self.timeout.as_millis() as u64,
                        };
                        observer.engine_finished(&result);
                        slots[index] = Some(result);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Only reachable with unfilled slots if the channel broke
        let results: Vec<EngineResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| EngineResult {
                    engine: engines[index].id().clone(),
                    outcome: Err(EngineError::Internal("worker vanished".into())),
                    elapsed_ms: 0,
                })
            })
            .collect();

        let results = FanoutResults::new(results);
        info!(
            succeeded = results.succeeded(),
            engines = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recognition fanout finished"
        );
        results
    }
}

fn spawn_worker(
    index: usize,
    engine: Arc<dyn Recognizer>,
    image: &Path,
    hints: &LanguageHints,
    claim: InFlightClaim,
    tx: mpsc::Sender<WorkerMessage>,
) -> std::io::Result<()> {
    let image: PathBuf = image.to_path_buf();
    let hints = hints.clone();

    std::thread::Builder::new()
        .name(format!("ocr-{}", engine.id()))
        .spawn(move || {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| engine.read(&image, &hints)))
                .unwrap_or_else(|payload| {
                    Err(EngineError::Internal(format!(
                        "engine panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            drop(claim);
            // Receiver is gone once the fanout returned; late results are dropped
            let _ = tx.send((index, outcome, started.elapsed().as_millis() as u64));
        })
        .map(|_| ())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_outcome(result: &EngineResult) {
    match &result.outcome {
        Ok(lines) => info!(
            engine = %result.engine,
            lines = lines.len(),
            elapsed_ms = result.elapsed_ms,
            "Engine finished"
        ),
        Err(err) => warn!(
            engine = %result.engine,
            error = %err,
            elapsed_ms = result.elapsed_ms,
            "Engine failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::recognition::MockRecognizer;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn run(fanout: &RecognitionFanout, engines: Vec<Arc<dyn Recognizer>>) -> FanoutResults {
        fanout.run_all(Path::new("enhanced.png"), &engines, &LanguageHints::new(["en"]), &NoopObserver)
    }

    fn ids(results: &FanoutResults) -> Vec<String> {
        results.iter().map(|r| r.engine.to_string()).collect()
    }

    /// Tracks the active set and its peak size.
    #[derive(Default)]
    struct RecordingObserver {
        active: Mutex<HashSet<EngineId>>,
        peak: Mutex<usize>,
        events: Mutex<Vec<String>>,
    }

    impl FanoutObserver for RecordingObserver {
        fn engine_started(&self, engine: &EngineId) {
            let mut active = self.active.lock().unwrap();
            active.insert(engine.clone());
            let mut peak = self.peak.lock().unwrap();
            *peak = (*peak).max(active.len());
            self.events.lock().unwrap().push(format!("start:{engine}"));
        }

        fn engine_finished(&self, result: &EngineResult) {
            self.active.lock().unwrap().remove(&result.engine);
            self.events.lock().unwrap().push(format!("end:{}", result.engine));
        }
    }

    #[test]
    fn results_keep_configuration_order() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::new("slow", &["a"]).with_delay(Duration::from_millis(150))),
            Arc::new(MockRecognizer::new("fast", &["b"])),
        ];

        let results = run(&fanout, engines);
        assert_eq!(ids(&results), vec!["slow", "fast"]);
        assert_eq!(results.succeeded(), 2);
    }

    #[test]
    fn one_failure_does_not_stop_others() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::new("a", &["one", "two"])),
            Arc::new(MockRecognizer::failing("b", EngineError::Internal("segfault".into()))),
            Arc::new(MockRecognizer::new("c", &["three"])),
        ];

        let results = run(&fanout, engines);
        assert_eq!(results.len(), 3);
        assert_eq!(results.succeeded(), 2);
        assert_eq!(
            results.get(&"b".into()).and_then(|r| r.error()),
            Some(&EngineError::Internal("segfault".into()))
        );
    }

    #[test]
    fn slow_engine_is_recorded_as_timeout() {
        let fanout = RecognitionFanout::new(Duration::from_millis(100));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::new("stuck", &["late"]).with_delay(Duration::from_secs(3))),
            Arc::new(MockRecognizer::new("quick", &["on time"])),
        ];

        let started = Instant::now();
        let results = run(&fanout, engines);

        assert!(started.elapsed() < Duration::from_secs(2), "fanout must not wait for abandoned engines");
        assert!(matches!(
            results.get(&"stuck".into()).and_then(|r| r.error()),
            Some(EngineError::Timeout { timeout_ms: 100 })
        ));
        assert!(results.get(&"quick".into()).unwrap().is_success());
    }

    #[test]
    fn abandoned_engine_is_not_called_again_while_running() {
        let fanout = RecognitionFanout::new(Duration::from_millis(100));
        let slow = Arc::new(MockRecognizer::new("slow", &["late"]).with_delay(Duration::from_millis(800)));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::clone(&slow) as Arc<dyn Recognizer>,
            Arc::new(MockRecognizer::new("quick", &["on time"])),
        ];

        let first = run(&fanout, engines.clone());
        assert!(matches!(
            first.get(&"slow".into()).and_then(|r| r.error()),
            Some(EngineError::Timeout { .. })
        ));

        let second = run(&fanout, engines.clone());
        assert!(matches!(
            second.get(&"slow".into()).and_then(|r| r.error()),
            Some(EngineError::Unavailable(_))
        ));
        assert!(second.get(&"quick".into()).unwrap().is_success());
        assert_eq!(slow.call_count(), 1);

        // Claim is released once the abandoned call returns
        std::thread::sleep(Duration::from_millis(1000));
        let third = run(&fanout, engines);
        assert!(matches!(
            third.get(&"slow".into()).and_then(|r| r.error()),
            Some(EngineError::Timeout { .. })
        ));
        assert_eq!(slow.call_count(), 2);
    }

    #[test]
    fn panicking_engine_releases_its_claim() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = vec![Arc::new(MockRecognizer::panicking("bad"))];

        run(&fanout, engines.clone());
        let again = run(&fanout, engines);
        let err = again.get(&"bad".into()).and_then(|r| r.error()).cloned();
        assert!(matches!(err, Some(EngineError::Internal(ref m)) if m.contains("panicked")));
    }

    #[test]
    fn panicking_engine_becomes_internal_error() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::panicking("bad")),
            Arc::new(MockRecognizer::new("good", &["fine"])),
        ];

        let results = run(&fanout, engines);
        let err = results.get(&"bad".into()).and_then(|r| r.error()).cloned();
        assert!(matches!(err, Some(EngineError::Internal(ref m)) if m.contains("panicked")));
        assert!(results.get(&"good".into()).unwrap().is_success());
    }

    #[test]
    fn engines_run_concurrently() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = (0..3)
            .map(|i| {
                Arc::new(
                    MockRecognizer::new(format!("e{i}").as_str(), &["x"])
                        .with_delay(Duration::from_millis(300)),
                ) as Arc<dyn Recognizer>
            })
            .collect();

        let started = Instant::now();
        let results = run(&fanout, engines);
        assert_eq!(results.succeeded(), 3);
        assert!(started.elapsed() < Duration::from_millis(850));
    }

    #[test]
    fn max_parallel_bounds_active_engines() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5)).with_max_parallel(Some(1));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::new("a", &["x"]).with_delay(Duration::from_millis(30))),
            Arc::new(MockRecognizer::new("b", &["y"]).with_delay(Duration::from_millis(30))),
            Arc::new(MockRecognizer::new("c", &["z"])),
        ];
        let observer = RecordingObserver::default();

        let results = fanout.run_all(Path::new("x.png"), &engines, &LanguageHints::default(), &observer);

        assert_eq!(results.succeeded(), 3);
        assert_eq!(*observer.peak.lock().unwrap(), 1);
        assert_eq!(
            *observer.events.lock().unwrap(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
    }

    #[test]
    fn observer_sees_every_engine_start_and_finish() {
        let fanout = RecognitionFanout::new(Duration::from_secs(5));
        let engines: Vec<Arc<dyn Recognizer>> = vec![
            Arc::new(MockRecognizer::new("a", &["x"])),
            Arc::new(MockRecognizer::failing("b", EngineError::Unavailable("missing".into()))),
        ];
        let observer = RecordingObserver::default();

        fanout.run_all(Path::new("x.png"), &engines, &LanguageHints::default(), &observer);

        let events = observer.events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| e.starts_with("start:")).count(), 2);
        assert_eq!(events.iter().filter(|e| e.starts_with("end:")).count(), 2);
        assert_eq!(*observer.peak.lock().unwrap(), 2);
        assert!(observer.active.lock().unwrap().is_empty());
    }

    #[test]
    fn no_engines_yields_empty_results() {
        let fanout = RecognitionFanout::new(Duration::from_secs(1));
        assert!(run(&fanout, vec![]).is_empty());
    }
}
