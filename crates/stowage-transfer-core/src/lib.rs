#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Transport-agnostic transfer interfaces and DTOs.
//!
//! Layout: `model` (jobs, outcomes, rates, daemon snapshots), `service`
//! (file-store and daemon seams), `error` (shared error taxonomy).

pub mod error;
pub mod model;
pub mod service;

pub use error::{
    DaemonError, DaemonResult, StoreError, StoreResult, TransferError, TransferResult,
};
pub use model::{
    DaemonJobId, DaemonProgress, DaemonState, DaemonStatus, DownloadJob, FailureReason, JobId,
    RateConfig, SourceChunk, TransferOutcome,
};
pub use service::{DaemonControl, FileStore, StoreReader, StoreWriter, UploadSource};
pub use stowage_events::JobState;
