use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine identity: the configured name, unique within one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EngineId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// ISO-639-1 language codes, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageHints(Vec<String>);

impl LanguageHints {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            codes
                .into_iter()
                .map(|c| c.into().trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
        )
    }

    pub fn codes(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined form used in query strings (`en,ne`).
    pub fn joined(&self) -> String {
        self.0.join(",")
    }
}

/// Per-engine failure, recorded in that engine's result slot.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// The engine cannot run at all: missing binary, model, or sidecar.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Engine timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Engine failed: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unavailable(_) => "engine_unavailable",
            EngineError::Timeout { .. } => "engine_timeout",
            EngineError::Internal(_) => "engine_internal_error",
        }
    }
}

/// One text recognition capability.
///
/// Implementations return lines in top-to-bottom reading order. No text is
/// `Ok(vec![])`, never an error.
pub trait Recognizer: Send + Sync {
    fn id(&self) -> &EngineId;

    /// Adapter family (`tesseract`, `http`, `mock`), for diagnostics.
    fn kind(&self) -> &'static str;

    fn read(&self, image: &Path, hints: &LanguageHints) -> Result<Vec<String>, EngineError>;
}

/// Outcome of one engine on one image. Immutable once produced.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub engine: EngineId,
    pub outcome: Result<Vec<String>, EngineError>,
    pub elapsed_ms: u64,
}

impl EngineResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn lines(&self) -> Option<&[String]> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.outcome.as_ref().err()
    }
}

/// Every configured engine's slot, in configuration (priority) order.
#[derive(Debug, Clone, Default)]
pub struct FanoutResults {
    slots: Vec<EngineResult>,
}

impl FanoutResults {
    pub fn new(slots: Vec<EngineResult>) -> Self {
        Self { slots }
    }

    pub fn get(&self, engine: &EngineId) -> Option<&EngineResult> {
        self.slots.iter().find(|slot| &slot.engine == engine)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineResult> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|s| s.is_success()).count()
    }
}

impl<'a> IntoIterator for &'a FanoutResults {
    type Item = &'a EngineResult;
    type IntoIter = std::slice::Iter<'a, EngineResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_hints_are_normalised() {
        let hints = LanguageHints::new([" EN ", "", "ne"]);
        assert_eq!(hints.codes(), &["en".to_string(), "ne".to_string()]);
        assert_eq!(hints.joined(), "en,ne");
    }

    #[test]
    fn engine_error_serializes_with_kind() {
        let json = serde_json::to_value(EngineError::Timeout { timeout_ms: 500 }).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["detail"]["timeout_ms"], 500);

        let json = serde_json::to_value(EngineError::Unavailable("no binary".into())).unwrap();
        assert_eq!(json["kind"], "unavailable");
        assert_eq!(json["detail"], "no binary");
    }

    #[test]
    fn fanout_results_lookup_by_engine() {
        let results = FanoutResults::new(vec![
            EngineResult {
                engine: "a".into(),
                outcome: Ok(vec!["x".into()]),
                elapsed_ms: 1,
            },
            EngineResult {
                engine: "b".into(),
                outcome: Err(EngineError::Internal("boom".into())),
                elapsed_ms: 2,
            },
        ]);

        assert_eq!(results.len(), 2);
        assert_eq!(results.succeeded(), 1);
        assert_eq!(results.get(&"a".into()).and_then(|r| r.lines()).map(|l| l.len()), Some(1));
        assert!(results.get(&"b".into()).unwrap().error().is_some());
        assert!(results.get(&"c".into()).is_none());
    }

    #[test]
    fn engine_id_displays_name() {
        assert_eq!(EngineId::new("tesseract").to_string(), "tesseract");
    }
}
