//! Turning per-engine outputs into one text.
//!
//! Every successful slot is normalised first (see [`normalize_lines`]), then
//! one of two policies applies:
//!
//! - `PickBest`: the engine with the most normalised lines wins; ties go to
//!   the engine configured first.
//! - `ConcatenateLabeled`: every engine's block under its name, failures
//!   annotated in place.
//!
//! Both fail with `NoTextDetected` when no engine produced usable text.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::recognition::{EngineId, FanoutResults};
use super::MergeError;

/// Lines this short are treated as detection noise.
const NOISE_FLOOR_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    PickBest,
    ConcatenateLabeled,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::PickBest => f.write_str("pick_best"),
            MergePolicy::ConcatenateLabeled => f.write_str("concatenate_labeled"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pick_best" => Ok(MergePolicy::PickBest),
            "concatenate_labeled" | "concatenate" => Ok(MergePolicy::ConcatenateLabeled),
            other => Err(format!(
                "unknown merge policy '{other}' (expected pick_best or concatenate_labeled)"
            )),
        }
    }
}

/// Clean one engine's raw lines.
///
/// Trims each line, drops blank and all-digit lines, drops repeats of an
/// earlier line, then drops lines of two characters or fewer unless that
/// would leave nothing.
pub fn normalize_lines<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let kept: Vec<String> = raw
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .filter(|line| !is_digit_line(line))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect();

    let substantial: Vec<String> = kept
        .iter()
        .filter(|line| line.chars().count() > NOISE_FLOOR_CHARS)
        .cloned()
        .collect();

    if substantial.is_empty() {
        kept
    } else {
        substantial
    }
}

/// ASCII or Devanagari decimal digits only. Fractions and numeral letters
/// such as `½` or `Ⅻ` are text.
fn is_digit_line(line: &str) -> bool {
    line.chars()
        .all(|c| c.is_ascii_digit() || ('\u{0966}'..='\u{096F}').contains(&c))
}

/// Final text of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedText {
    pub text: String,
    /// Normalised lines behind `text`, in output order.
    pub lines: Vec<String>,
    /// Winning engine under `PickBest`; `None` for labelled output.
    pub selected_engine: Option<EngineId>,
    pub policy: MergePolicy,
}

pub struct ResultMerger {
    policy: MergePolicy,
}

impl ResultMerger {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn select(&self, results: &FanoutResults) -> Result<MergedText, MergeError> {
        let usable: Vec<(&EngineId, Vec<String>)> = results
            .iter()
            .filter_map(|slot| slot.lines().map(|lines| (&slot.engine, normalize_lines(lines))))
            .filter(|(_, lines)| !lines.is_empty())
            .collect();

        if usable.is_empty() {
            debug!(engines = results.len(), "No engine produced usable text");
            return Err(MergeError::NoTextDetected);
        }

        match self.policy {
            MergePolicy::PickBest => pick_best(usable).ok_or(MergeError::NoTextDetected),
            MergePolicy::ConcatenateLabeled => Ok(concatenate_labeled(results)),
        }
    }
}

fn pick_best(usable: Vec<(&EngineId, Vec<String>)>) -> Option<MergedText> {
    let mut candidates = usable.into_iter();
    let mut best = candidates.next()?;
    for candidate in candidates {
        // Strict comparison keeps the earlier engine on ties
        if candidate.1.len() > best.1.len() {
            best = candidate;
        }
    }

    let (engine, lines) = best;
    debug!(engine = %engine, lines = lines.len(), "Selected best engine");
    Some(MergedText {
        text: lines.join("\n"),
        lines,
        selected_engine: Some(engine.clone()),
        policy: MergePolicy::PickBest,
    })
}

fn concatenate_labeled(results: &FanoutResults) -> MergedText {
    let mut blocks = Vec::with_capacity(results.len());
    let mut all_lines = Vec::new();

    for slot in results {
        let body = match &slot.outcome {
            Ok(raw) => {
                let lines = normalize_lines(raw);
                if lines.is_empty() {
                    "[no text]".to_string()
                } else {
                    let body = lines.join("\n");
                    all_lines.extend(lines);
                    body
                }
            }
            Err(err) => format!("[{}: {err}]", err.code()),
        };
        blocks.push(format!("{}:\n{body}", slot.engine));
    }

    MergedText {
        text: blocks.join("\n"),
        lines: all_lines,
        selected_engine: None,
        policy: MergePolicy::ConcatenateLabeled,
    }
}
