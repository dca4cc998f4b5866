#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Stowage application wiring.
//!
//! Layout: `bootstrap.rs` (service wiring), `orchestrator.rs` (server fetch
//! state machine), `facade.rs` (owner-facing entry point), `error.rs`.

/// Application bootstrap and environment loading.
pub mod bootstrap;
/// Application-level errors.
pub mod error;
/// Shared transfer context.
pub mod facade;
/// Server fetch orchestration.
pub mod orchestrator;

pub use bootstrap::{BootstrapDependencies, run_app, serve};
pub use error::{AppError, AppResult, OrchestratorError, OrchestratorResult};
pub use facade::{JobStatusView, TransferFacade};
pub use orchestrator::{
    DAEMON_COMPONENT, DownloadOrchestrator, OrchestratorSettings, PollReport, RecoveryReport,
};
