//! HTTP surface for the OCR service.
//!
//! `ocr_router()` returns a composable `Router`; `start_server()` binds it
//! and runs it in the background until shut down.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;
pub mod upload;

pub use router::ocr_router;
pub use server::{start_server, OcrServer, ServerError};
pub use types::ApiContext;
