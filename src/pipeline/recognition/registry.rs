//! Named engine variants built from configuration.
//!
//! Adding or removing an engine is a config change: each `EngineSpec` maps
//! to exactly one adapter, and configuration order is engine priority.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::engines::{HttpRecognizer, MockRecognizer, TesseractCli};
use super::types::Recognizer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineKind {
    Tesseract {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<PathBuf>,
    },
    Http {
        url: String,
    },
    Mock {
        #[serde(default)]
        lines: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: EngineKind,
}

impl EngineSpec {
    pub fn tesseract(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EngineKind::Tesseract { binary: None },
        }
    }

    pub fn http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EngineKind::Http {
                url: url.to_string(),
            },
        }
    }

    pub fn mock(name: &str, lines: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: EngineKind::Mock { lines },
        }
    }
}

/// Build one adapter. `timeout` bounds the HTTP client and the tesseract process.
pub fn build_engine(spec: &EngineSpec, timeout: Duration) -> Arc<dyn Recognizer> {
    let name = spec.name.as_str();
    match &spec.kind {
        EngineKind::Tesseract { binary } => {
            let engine = TesseractCli::new(name).with_timeout(timeout);
            match binary {
                Some(path) => Arc::new(engine.with_binary(path)),
                None => Arc::new(engine),
            }
        }
        EngineKind::Http { url } => Arc::new(HttpRecognizer::new(name, url.as_str(), timeout)),
        EngineKind::Mock { lines } => Arc::new(MockRecognizer::from_lines(name, lines.clone())),
    }
}

/// Build every configured engine, preserving order.
pub fn build_engines(specs: &[EngineSpec], timeout: Duration) -> Vec<Arc<dyn Recognizer>> {
    let engines: Vec<_> = specs.iter().map(|spec| build_engine(spec, timeout)).collect();
    for engine in &engines {
        tracing::info!(engine = %engine.id(), kind = engine.kind(), "Recognition engine registered");
    }
    engines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_each_kind_in_order() {
        let specs = vec![
            EngineSpec::tesseract("tesseract"),
            EngineSpec::http("easyocr", "http://127.0.0.1:8866/ocr"),
            EngineSpec::mock("dev", vec!["hello".into()]),
        ];
        let engines = build_engines(&specs, Duration::from_secs(5));

        let kinds: Vec<_> = engines.iter().map(|e| (e.id().as_str(), e.kind())).collect();
        assert_eq!(
            kinds,
            vec![("tesseract", "tesseract"), ("easyocr", "http"), ("dev", "mock")]
        );
    }

    #[test]
    fn spec_deserializes_flat_json() {
        let spec: EngineSpec =
            serde_json::from_str(r#"{ "name": "paddle", "kind": "http", "url": "http://x/ocr" }"#)
                .unwrap();
        assert_eq!(spec, EngineSpec::http("paddle", "http://x/ocr"));

        let spec: EngineSpec =
            serde_json::from_str(r#"{ "name": "tesseract", "kind": "tesseract" }"#).unwrap();
        assert_eq!(spec, EngineSpec::tesseract("tesseract"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result: Result<EngineSpec, _> =
            serde_json::from_str(r#"{ "name": "x", "kind": "carrier_pigeon" }"#);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn tesseract_engine_uses_engine_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "exec sleep 5\n").unwrap();

        let spec = EngineSpec {
            name: "tesseract".into(),
            kind: EngineKind::Tesseract {
                binary: Some(PathBuf::from("/bin/sh")),
            },
        };
        let engine = build_engine(&spec, Duration::from_millis(300));
        let err = engine.read(&script, &Default::default()).unwrap_err();
        assert_eq!(err, crate::pipeline::recognition::EngineError::Timeout { timeout_ms: 300 });
    }

    #[test]
    fn mock_engine_returns_configured_lines() {
        let engine = build_engine(&EngineSpec::mock("dev", vec!["hello".into()]), Duration::from_secs(1));
        let lines = engine
            .read(std::path::Path::new("x.png"), &Default::default())
            .unwrap();
        assert_eq!(lines, vec!["hello"]);
    }
}
