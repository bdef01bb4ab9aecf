//! Download orchestration.
//!
//! This module provides:
//! - `DownloadOrchestrator`: bounded-concurrency batch runner
//! - `DownloadTask`: per-download state shared with observers
//! - `Transport`: the byte source, with `HttpTransport` over reqwest

mod orchestrator;
mod task;
mod transport;
mod types;

pub use orchestrator::{part_path, DownloadOrchestrator};
pub use task::{DownloadTask, TaskHandle, TaskProgressCallback};
pub use transport::{HttpTransport, TransferResponse, Transport};
pub use types::{
    DownloadError, DownloadOutcome, DownloadProgress, DownloadRequest, DownloadState,
    ExecutionReport, Priority, VerificationMethod,
};
