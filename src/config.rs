//! Service configuration.
//!
//! Defaults → optional JSON file (`POLYOCR_CONFIG`) → environment overrides.
//! The merged result is validated once at startup; every component receives
//! its own slice of the config by value.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::merge::MergePolicy;
use crate::pipeline::preprocess::EnhancementConfig;
use crate::pipeline::recognition::{EngineKind, EngineSpec};

/// Application-level constants
pub const APP_NAME: &str = "polyocr";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the single enhanced artifact inside the work directory.
pub const ENHANCED_FILE_NAME: &str = "enhanced.png";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 60;
/// One hour; deadlines are computed as `Instant::now() + timeout`.
pub const MAX_ENGINE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024; // 20 MB

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "polyocr=info,polyocr_lib=info,tower_http=info"
}

/// Default work directory: `<cache dir>/polyocr`, or `./uploads` when the
/// platform has no cache dir.
pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("uploads"))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the service needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    /// Holds uploads and the single enhanced artifact.
    pub work_dir: PathBuf,
    /// Enabled engines, in priority order.
    pub engines: Vec<EngineSpec>,
    pub engine_timeout_secs: u64,
    /// Worker cap for the fanout. `None` runs every engine at once.
    pub max_parallel_engines: Option<usize>,
    pub merge_policy: MergePolicy,
    /// ISO-639-1 codes passed to every recognizer.
    pub language_hints: Vec<String>,
    pub max_upload_bytes: usize,
    pub enhancement: EnhancementConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            work_dir: default_work_dir(),
            engines: vec![EngineSpec::tesseract("tesseract")],
            engine_timeout_secs: DEFAULT_ENGINE_TIMEOUT_SECS,
            max_parallel_engines: None,
            merge_policy: MergePolicy::PickBest,
            language_hints: vec!["en".into(), "ne".into()],
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            enhancement: EnhancementConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment: defaults, then the JSON file named
    /// by `POLYOCR_CONFIG`, then individual `POLYOCR_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`ServiceConfig::load`] with an injectable variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("POLYOCR_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("POLYOCR_BIND") {
            self.bind_addr = addr;
        }
        if let Some(dir) = lookup("POLYOCR_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(list) = lookup("POLYOCR_ENGINES") {
            self.engines = parse_engine_list(&list)?;
        }
        if let Some(raw) = lookup("POLYOCR_ENGINE_TIMEOUT_SECS") {
            self.engine_timeout_secs = parse_number("POLYOCR_ENGINE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("POLYOCR_MAX_PARALLEL") {
            self.max_parallel_engines = Some(parse_number("POLYOCR_MAX_PARALLEL", &raw)?);
        }
        if let Some(raw) = lookup("POLYOCR_MERGE_POLICY") {
            self.merge_policy = raw.parse().map_err(|reason| ConfigError::Env {
                var: "POLYOCR_MERGE_POLICY",
                reason,
            })?;
        }
        if let Some(raw) = lookup("POLYOCR_LANGS") {
            self.language_hints = split_list(&raw);
        }
        if let Some(raw) = lookup("POLYOCR_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_number("POLYOCR_MAX_UPLOAD_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("POLYOCR_UPSCALE") {
            self.enhancement.upscale_factor = parse_number("POLYOCR_UPSCALE", &raw)?;
        }
        if let Some(raw) = lookup("POLYOCR_DENOISE") {
            self.enhancement.denoise_strength = parse_number("POLYOCR_DENOISE", &raw)?;
        }
        if let Some(raw) = lookup("POLYOCR_THRESHOLD_BLOCK") {
            self.enhancement.threshold_block_size = parse_number("POLYOCR_THRESHOLD_BLOCK", &raw)?;
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engines.is_empty() {
            return Err(ConfigError::Invalid("at least one engine must be enabled".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.engines {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("engine name must not be empty".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "engine '{}' is configured twice",
                    spec.name
                )));
            }
        }

        if self.engine_timeout_secs == 0 {
            return Err(ConfigError::Invalid("engine_timeout_secs must be > 0".into()));
        }
        if self.engine_timeout_secs > MAX_ENGINE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "engine_timeout_secs must be <= {MAX_ENGINE_TIMEOUT_SECS}, got {}",
                self.engine_timeout_secs
            )));
        }
        if self.max_parallel_engines == Some(0) {
            return Err(ConfigError::Invalid("max_parallel_engines must be > 0".into()));
        }

        self.enhancement.validate().map_err(ConfigError::Invalid)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// Well-known path of the enhanced artifact, overwritten by every job.
    pub fn enhanced_path(&self) -> PathBuf {
        self.work_dir.join(ENHANCED_FILE_NAME)
    }
}

/// Parse `POLYOCR_ENGINES`: `tesseract,easyocr=http://127.0.0.1:8866/ocr,dev=mock`.
///
/// A bare name is only valid for `tesseract`; every other engine needs an
/// HTTP endpoint (or the literal `mock`).
fn parse_engine_list(raw: &str) -> Result<Vec<EngineSpec>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, "mock")) => Ok(EngineSpec::mock(name.trim(), vec![])),
            Some((name, url)) => Ok(EngineSpec {
                name: name.trim().to_string(),
                kind: EngineKind::Http {
                    url: url.trim().to_string(),
                },
            }),
            None if entry == "tesseract" => Ok(EngineSpec::tesseract(&entry)),
            None => Err(ConfigError::Env {
                var: "POLYOCR_ENGINES",
                reason: format!("engine '{entry}' needs an endpoint (name=url)"),
            }),
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        reason: e.to_string(),
    })
}
