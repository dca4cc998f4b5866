//! Process-wide entry point for client transfers and server fetches.

use std::sync::Arc;

use serde::Serialize;
use stowage_events::{EventBus, EventId, EventStream};
use stowage_telemetry::Metrics;
use stowage_transfer::{ClientTransfer, Throttled};
use stowage_transfer_core::{
    DaemonProgress, DownloadJob, JobId, RateConfig, StoreReader, TransferOutcome,
    TransferResult, UploadSource,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::DownloadOrchestrator;

/// A job together with the daemon's live progress, when it has any.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    /// Persisted job record.
    pub job: DownloadJob,
    /// Daemon-reported progress for running jobs.
    pub progress: Option<DaemonProgress>,
    /// Completion percentage derived from `progress`.
    pub percent_complete: Option<f64>,
}

/// Shared context holding the transfer service and the orchestrator.
///
/// Built once during bootstrap and handed around as `Arc<TransferFacade>`.
/// Server-fetch lookups are scoped to the calling owner: another owner's job
/// is reported as [`OrchestratorError::NotFound`].
pub struct TransferFacade {
    transfer: ClientTransfer,
    orchestrator: Arc<DownloadOrchestrator>,
    events: EventBus,
    metrics: Metrics,
}

impl TransferFacade {
    /// Assemble the facade.
    #[must_use]
    pub const fn new(
        transfer: ClientTransfer,
        orchestrator: Arc<DownloadOrchestrator>,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            transfer,
            orchestrator,
            events,
            metrics,
        }
    }

    /// The orchestrator, for the poll task and startup recovery.
    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<DownloadOrchestrator> {
        &self.orchestrator
    }

    /// Metrics registry shared by every component.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Open a stored file as a throttled stream.
    ///
    /// # Errors
    ///
    /// See [`ClientTransfer::download`].
    pub async fn download(
        &self,
        owner: &str,
        path: &str,
        rate: Option<RateConfig>,
    ) -> TransferResult<Throttled<Box<dyn StoreReader>>> {
        self.transfer.download(owner, path, rate).await
    }

    /// Store a client upload; the outcome reports denial, truncation or failure.
    pub async fn upload<S: UploadSource>(
        &self,
        owner: &str,
        file_name: &str,
        source: S,
        declared_size: u64,
        rate: Option<RateConfig>,
    ) -> TransferOutcome {
        self.transfer
            .upload(owner, file_name, source, declared_size, rate)
            .await
    }

    /// Ask the daemon to fetch `source_uri` into the owner's store.
    ///
    /// # Errors
    ///
    /// See [`DownloadOrchestrator::enqueue`].
    pub async fn enqueue_server_fetch(
        &self,
        owner: &str,
        source_uri: &str,
        destination_path: &str,
    ) -> OrchestratorResult<DownloadJob> {
        self.orchestrator
            .enqueue(owner, source_uri, destination_path)
            .await
    }

    /// Cancel one of the owner's fetches.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] for unknown or foreign jobs.
    pub async fn cancel_server_fetch(&self, owner: &str, id: JobId) -> OrchestratorResult<DownloadJob> {
        self.owned(owner, id).await?;
        self.orchestrator.cancel(id).await
    }

    /// Current record and live progress of one of the owner's fetches.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] for unknown or foreign jobs.
    pub async fn get_job_status(&self, owner: &str, id: JobId) -> OrchestratorResult<JobStatusView> {
        let job = self.owned(owner, id).await?;
        let progress = self.orchestrator.progress(&job).await;
        Ok(JobStatusView {
            percent_complete: progress.as_ref().map(DaemonProgress::percent_complete),
            progress,
            job,
        })
    }

    /// Every fetch of the owner, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn list_server_fetches(&self, owner: &str) -> OrchestratorResult<Vec<DownloadJob>> {
        self.orchestrator.list_for_owner(owner).await
    }

    /// Acknowledge and remove one of the owner's finished fetches.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] for unknown or foreign jobs and
    /// [`OrchestratorError::NotTerminal`] for fetches still in flight.
    pub async fn dismiss_server_fetch(&self, owner: &str, id: JobId) -> OrchestratorResult<DownloadJob> {
        self.owned(owner, id).await?;
        self.orchestrator.dismiss(id).await
    }

    /// Subscribe to domain events, replaying buffered events after `since`.
    #[must_use]
    pub fn subscribe(&self, since: Option<EventId>) -> EventStream {
        self.events.subscribe(since)
    }

    async fn owned(&self, owner: &str, id: JobId) -> OrchestratorResult<DownloadJob> {
        let job = self.orchestrator.get(id).await?;
        if job.owner_id != owner {
            return Err(OrchestratorError::NotFound { id });
        }
        Ok(job)
    }
}
