//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;
use std::path::PathBuf;

use stowage_events::JobState;
use stowage_runtime::RegistryError;
use stowage_transfer_core::{DaemonError, DownloadJob, JobId};
use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Result alias for orchestrator and facade operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the download orchestrator and the transfer facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A non-terminal fetch already targets the destination.
    #[error("server fetch conflict")]
    Conflict {
        /// The fetch holding the destination.
        existing: Box<DownloadJob>,
    },
    /// No fetch with the identifier is visible to the caller.
    #[error("server fetch not found")]
    NotFound {
        /// Requested job identifier.
        id: JobId,
    },
    /// The fetch is still in flight.
    #[error("server fetch is not finished")]
    NotTerminal {
        /// Job identifier.
        id: JobId,
        /// Current state.
        state: JobState,
    },
    /// The job registry failed.
    #[error("job registry operation failed")]
    Registry {
        /// Operation identifier.
        operation: &'static str,
        /// Source registry error.
        #[source]
        source: RegistryError,
    },
}

impl OrchestratorError {
    /// Lift a registry error, keeping caller-facing variants distinct.
    pub(crate) fn registry(operation: &'static str, source: RegistryError) -> Self {
        match source {
            RegistryError::Conflict { existing } => Self::Conflict { existing },
            RegistryError::NotFound { id } => Self::NotFound { id },
            RegistryError::NotTerminal { id, state } => Self::NotTerminal { id, state },
            source => Self::Registry { operation, source },
        }
    }
}

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Environment configuration was missing.
    #[error("missing environment configuration")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: &'static str,
    },
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: stowage_config::ConfigError,
    },
    /// A configuration value was rejected while wiring services.
    #[error("invalid configuration")]
    InvalidConfig {
        /// Field that failed validation.
        field: &'static str,
        /// Reason for the validation failure.
        reason: &'static str,
        /// Optional value associated with the failure.
        value: Option<String>,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: stowage_telemetry::TelemetryError,
    },
    /// Database connection failed.
    #[error("database operation failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source database error.
        source: sqlx::Error,
    },
    /// Job registry persistence failed.
    #[error("runtime persistence failed")]
    Runtime {
        /// Operation identifier.
        operation: &'static str,
        /// Source registry error.
        source: RegistryError,
    },
    /// Daemon client construction failed.
    #[error("download daemon operation failed")]
    Daemon {
        /// Operation identifier.
        operation: &'static str,
        /// Source daemon error.
        source: DaemonError,
    },
    /// Orchestrator operations failed.
    #[error("download orchestration failed")]
    Orchestrator {
        /// Operation identifier.
        operation: &'static str,
        /// Source orchestrator error.
        source: OrchestratorError,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: stowage_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: stowage_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn runtime(operation: &'static str, source: RegistryError) -> Self {
        Self::Runtime { operation, source }
    }

    pub(crate) const fn orchestrator(operation: &'static str, source: OrchestratorError) -> Self {
        Self::Orchestrator { operation, source }
    }

    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: Some(path.into()),
            source,
        }
    }
}
