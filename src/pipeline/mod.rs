pub mod filters;
pub mod preprocess;
pub mod recognition;
pub mod merge;
pub mod orchestrator;

pub use merge::*;
pub use orchestrator::*;
pub use preprocess::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnhanceError {
    #[error("Unreadable image {path}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },

    #[error("Failed to write enhanced image {path}: {reason}")]
    WriteFailure { path: PathBuf, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("No text detected")]
    NoTextDetected,
}

/// Job-level failures. Engine failures only surface here when every engine failed.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Another OCR job is already running")]
    Busy,

    #[error("No recognition engines configured")]
    NoEngines,

    #[error(transparent)]
    Enhance(#[from] EnhanceError),

    #[error("No text detected")]
    NoTextDetected,

    #[error("OCR worker failed: {0}")]
    Worker(String),
}

impl From<MergeError> for JobError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::NoTextDetected => JobError::NoTextDetected,
        }
    }
}
