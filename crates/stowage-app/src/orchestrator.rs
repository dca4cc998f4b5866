//! Server-side fetch orchestration over the external download daemon.
//!
//! # Design
//! - Jobs move through the registry's compare-and-set transitions only; a
//!   `StaleState` answer means another writer got there first and is not an error.
//! - One poll pass runs at a time. Status queries fan out on a `JoinSet`, each
//!   bounded by the daemon timeout, and their results are applied in sequence.
//! - An unreachable daemon never changes job state; it backs the job off and
//!   flips the health signal.
//! - A daemon fetch that hands its payload to a follow-up (magnet metadata,
//!   `.torrent` files) is never imported; the job tracks the follow-up instead.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use stowage_config::TransferConfig;
use stowage_events::{Event, EventBus, JobState};
use stowage_runtime::{JobRegistry, RegistryError, RegistryResult};
use stowage_telemetry::Metrics;
use stowage_transfer_core::{
    DaemonControl, DaemonError, DaemonJobId, DaemonProgress, DaemonResult, DaemonState,
    DaemonStatus, DownloadJob, FailureReason, FileStore, JobId,
};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Health component reported while the daemon cannot be reached.
pub const DAEMON_COMPONENT: &str = "download_daemon";

/// Attempts made when a cancellation races a concurrent transition.
const CANCEL_ATTEMPTS: usize = 3;

/// Suffix of aria2's resume control files; its presence marks a partial fetch.
const CONTROL_FILE_EXTENSION: &str = "aria2";

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Parent of the per-job staging directories handed to the daemon.
    pub staging_root: PathBuf,
    /// Time between poll passes; also the backoff base.
    pub poll_interval: Duration,
    /// Upper bound on one daemon call.
    pub daemon_timeout: Duration,
    /// Cap on per-job backoff.
    pub max_backoff: Duration,
    /// Age after which completed jobs are purged.
    pub completed_retention: Duration,
}

impl OrchestratorSettings {
    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            poll_interval: config.poll_interval,
            daemon_timeout: config.daemon_timeout,
            max_backoff: config.max_backoff,
            completed_retention: config.completed_retention,
        }
    }
}

/// What one poll pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Another pass was running; nothing was done.
    pub skipped: bool,
    /// Status queries answered or timed out.
    pub checked: usize,
    /// Jobs whose state changed.
    pub transitioned: usize,
    /// Jobs left alone because the daemon was unreachable or they are backing off.
    pub deferred: usize,
    /// Pending cancellations the daemon acknowledged.
    pub cancelled: usize,
    /// Completed jobs purged after their retention.
    pub purged: u64,
    /// Startup reconciliation that was still pending and ran in this pass.
    pub recovery: Option<RecoveryReport>,
}

/// What startup reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The daemon was unreachable; nothing changed and the poll loop retries.
    pub deferred: bool,
    /// Queued jobs handed to the daemon again.
    pub resubmitted: usize,
    /// Jobs the daemon still holds.
    pub untouched: usize,
    /// Orphans whose artifact was found.
    pub completed: usize,
    /// Jobs that could not be recovered.
    pub failed: usize,
}

impl RecoveryReport {
    fn tally(&mut self, job: &DownloadJob) {
        match job.state {
            JobState::Complete => self.completed += 1,
            JobState::Failed => self.failed += 1,
            _ => self.untouched += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

#[derive(Debug, Default)]
struct PollState {
    backoff: HashMap<JobId, Backoff>,
    recovery_pending: bool,
}

impl PollState {
    fn ready(&self, id: JobId, now: Instant) -> bool {
        self.backoff
            .get(&id)
            .is_none_or(|backoff| backoff.retry_at <= now)
    }

    fn defer(&mut self, id: JobId, settings: &OrchestratorSettings) -> Duration {
        let now = Instant::now();
        let entry = self.backoff.entry(id).or_insert(Backoff {
            failures: 0,
            retry_at: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = backoff_delay(settings.poll_interval, settings.max_backoff, entry.failures);
        entry.retry_at = now + delay;
        delay
    }

    fn clear(&mut self, id: JobId) {
        self.backoff.remove(&id);
    }
}

/// Delay before the next status query after `failures` consecutive failures.
fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1_u32 << exponent).min(cap)
}

fn describe(err: &dyn Error) -> String {
    err.source()
        .map_or_else(|| err.to_string(), |source| format!("{err}: {source}"))
}

/// Drives server fetches from acceptance to import.
pub struct DownloadOrchestrator {
    registry: Arc<JobRegistry>,
    daemon: Arc<dyn DaemonControl>,
    store: Arc<dyn FileStore>,
    events: EventBus,
    metrics: Metrics,
    settings: OrchestratorSettings,
    poll_state: Mutex<PollState>,
    degraded: AtomicBool,
    started_at: DateTime<Utc>,
}

impl DownloadOrchestrator {
    /// Wire the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<JobRegistry>,
        daemon: Arc<dyn DaemonControl>,
        store: Arc<dyn FileStore>,
        events: EventBus,
        metrics: Metrics,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            daemon,
            store,
            events,
            metrics,
            settings,
            poll_state: Mutex::new(PollState::default()),
            degraded: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// Staging directory handed to the daemon for `id`.
    #[must_use]
    pub fn staging_dir(&self, id: JobId) -> PathBuf {
        self.settings.staging_root.join(id.to_string())
    }

    /// Whether the daemon is currently considered unreachable.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Accept a server fetch and hand it to the daemon.
    ///
    /// A fetch the daemon refuses, or cannot be asked to take, is returned in
    /// the failed state rather than as an error.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Conflict`] when a non-terminal fetch already
    /// targets `destination_path` for `owner_id`.
    pub async fn enqueue(
        &self,
        owner_id: &str,
        source_uri: &str,
        destination_path: &str,
    ) -> OrchestratorResult<DownloadJob> {
        let job = self
            .registry
            .create(DownloadJob::queued(owner_id, source_uri, destination_path))
            .await
            .map_err(|err| OrchestratorError::registry("enqueue.create", err))?;
        self.metrics.inc_job_transition(JobState::Queued.as_str());
        self.events.publish(Event::JobQueued {
            job_id: job.id.as_uuid(),
            owner_id: job.owner_id.clone(),
            destination_path: job.destination_path.clone(),
        });
        info!(
            job_id = %job.id,
            owner = %job.owner_id,
            destination = %job.destination_path,
            "server fetch queued"
        );
        self.submit(job).await
    }

    /// Fetch a job by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] for unknown identifiers.
    pub async fn get(&self, id: JobId) -> OrchestratorResult<DownloadJob> {
        self.registry
            .get(id)
            .await
            .map_err(|err| OrchestratorError::registry("get", err))
    }

    /// Every job of one owner.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn list_for_owner(&self, owner_id: &str) -> OrchestratorResult<Vec<DownloadJob>> {
        self.registry
            .list_for_owner(owner_id)
            .await
            .map_err(|err| OrchestratorError::registry("list_for_owner", err))
    }

    /// Live progress of a running job; `None` when the daemon cannot say.
    pub async fn progress(&self, job: &DownloadJob) -> Option<DaemonProgress> {
        if !job.state.is_running() {
            return None;
        }
        let daemon_id = job.tracked_daemon_id()?;
        self.bounded("status", self.daemon.status(daemon_id))
            .await
            .ok()
            .map(|status| status.progress)
    }

    /// Cancel a job.
    ///
    /// Terminal jobs are returned unchanged. When the daemon cannot be reached
    /// the job keeps running with `cancel_requested` set and the poll pass
    /// finishes the cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] for unknown identifiers.
    pub async fn cancel(&self, id: JobId) -> OrchestratorResult<DownloadJob> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.get(id).await?;
            let attempt = match job.state {
                JobState::Complete | JobState::Failed => return Ok(job),
                JobState::Queued | JobState::Orphaned => {
                    if let Some(daemon_id) = job.tracked_daemon_id() {
                        self.abort_quietly(job.id, daemon_id).await;
                    }
                    self.fail(&job, FailureReason::Cancelled).await
                }
                JobState::Active | JobState::Paused => self.cancel_running(&job).await,
            };
            match attempt {
                Ok(job) => return Ok(job),
                Err(RegistryError::StaleState { .. }) => {
                    debug!(job_id = %id, "job moved during cancellation; retrying");
                }
                Err(err) => return Err(OrchestratorError::registry("cancel", err)),
            }
        }
        self.get(id).await
    }

    /// Remove a finished job and whatever is left in its staging directory.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotTerminal`] for jobs still in flight.
    pub async fn dismiss(&self, id: JobId) -> OrchestratorResult<DownloadJob> {
        let job = self
            .registry
            .remove(id)
            .await
            .map_err(|err| OrchestratorError::registry("dismiss", err))?;
        self.clear_staging(id).await;
        info!(job_id = %id, state = %job.state, "server fetch dismissed");
        Ok(job)
    }

    /// Run one reconciliation pass against the daemon.
    ///
    /// # Errors
    ///
    /// Propagates registry failures while listing jobs; per-job failures are
    /// logged and leave the job for the next pass.
    pub async fn poll(&self) -> OrchestratorResult<PollReport> {
        let Ok(mut state) = self.poll_state.try_lock() else {
            debug!("poll pass already running; skipping");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        };
        let mut report = PollReport::default();

        if state.recovery_pending {
            let recovery = self.recover_locked(&mut state).await?;
            report.recovery = Some(recovery);
        }

        let jobs = self
            .registry
            .list_non_terminal()
            .await
            .map_err(|err| OrchestratorError::registry("poll.list", err))?;
        state
            .backoff
            .retain(|id, _| jobs.iter().any(|job| job.id == *id));

        let now = Instant::now();
        let mut queries = JoinSet::new();
        for job in jobs {
            if job.state == JobState::Orphaned {
                let resolved = self.resolve_orphan(&job).await;
                record(&mut report, &job, resolved.map(Some));
                continue;
            }
            if !job.state.is_running() {
                // Queued jobs belong to an enqueue still talking to the daemon.
                continue;
            }
            if !state.ready(job.id, now) {
                report.deferred += 1;
                continue;
            }
            let Some(daemon_id) = job.tracked_daemon_id().cloned() else {
                let orphaned = self.orphan(&job).await;
                record(&mut report, &job, orphaned.map(Some));
                continue;
            };
            if job.cancel_requested {
                self.retry_cancel(&mut state, &mut report, &job, &daemon_id)
                    .await;
                continue;
            }

            let daemon = Arc::clone(&self.daemon);
            let limit = self.settings.daemon_timeout;
            queries.spawn(async move {
                let status = match time::timeout(limit, daemon.status(&daemon_id)).await {
                    Ok(status) => status,
                    Err(_) => Err(DaemonError::Unreachable {
                        operation: "status",
                        detail: format!("no answer within {limit:?}"),
                    }),
                };
                (job, status)
            });
        }

        let mut answers = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(answer) => answers.push(answer),
                Err(err) => warn!(error = %err, "status query task failed"),
            }
        }

        for (job, status) in answers {
            report.checked += 1;
            self.observe_daemon(&status);
            let applied = match status {
                Ok(status) => {
                    state.clear(job.id);
                    self.apply_status(&job, status).await
                }
                Err(DaemonError::UnknownJob { .. }) => {
                    state.clear(job.id);
                    self.orphan(&job).await.map(Some)
                }
                Err(err) => {
                    let retry_in = state.defer(job.id, &self.settings);
                    warn!(
                        job_id = %job.id,
                        error = %err,
                        detail = %err.detail(),
                        retry_in = ?retry_in,
                        "status query failed; job left unchanged"
                    );
                    report.deferred += 1;
                    Ok(None)
                }
            };
            record(&mut report, &job, applied);
        }

        report.purged = self.purge_expired().await;
        self.refresh_active_gauge().await;
        drop(state);

        if report.transitioned > 0 || report.deferred > 0 {
            info!(
                checked = report.checked,
                transitioned = report.transitioned,
                deferred = report.deferred,
                cancelled = report.cancelled,
                purged = report.purged,
                "poll pass finished"
            );
        }
        Ok(report)
    }

    /// Reconcile persisted jobs with the daemon after a restart.
    ///
    /// Running again without external changes transitions nothing.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn recover_on_startup(&self) -> OrchestratorResult<RecoveryReport> {
        let mut state = self.poll_state.lock().await;
        self.recover_locked(&mut state).await
    }

    /// Spawn the scheduled reconciliation task.
    pub fn spawn_poller(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let every = every.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match orchestrator.poll().await {
                    Ok(report) if report.skipped => debug!("poll tick skipped"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "download poll pass failed"),
                }
            }
        })
    }

    async fn recover_locked(&self, state: &mut PollState) -> OrchestratorResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let jobs = self
            .registry
            .list_non_terminal()
            .await
            .map_err(|err| OrchestratorError::registry("recover.list", err))?;
        if jobs.is_empty() {
            state.recovery_pending = false;
            return Ok(report);
        }

        let live: HashSet<DaemonJobId> =
            match self.bounded("list_jobs", self.daemon.list_jobs()).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(err) => {
                    warn!(
                        error = %err,
                        detail = %err.detail(),
                        pending = jobs.len(),
                        "daemon unavailable; startup reconciliation deferred"
                    );
                    state.recovery_pending = true;
                    report.deferred = true;
                    return Ok(report);
                }
            };
        state.recovery_pending = false;

        for job in jobs {
            let known = job.tracked_daemon_id().is_some_and(|id| live.contains(id));
            match job.state {
                // Accepted by this process; its enqueue call owns the hand-off.
                JobState::Queued if job.created_at >= self.started_at => report.untouched += 1,
                JobState::Queued if known => {
                    let resumed = self
                        .advance(&job, JobState::Active, None)
                        .await
                        .map_err(|err| OrchestratorError::registry("recover.resume", err))?;
                    report.resubmitted += 1;
                    report.tally(&resumed);
                }
                JobState::Queued if job.daemon_id.is_some() => {
                    let failed = self
                        .fail(&job, FailureReason::Interrupted)
                        .await
                        .map_err(|err| OrchestratorError::registry("recover.interrupted", err))?;
                    report.tally(&failed);
                }
                JobState::Queued => {
                    let submitted = self.submit(job).await?;
                    report.resubmitted += 1;
                    if submitted.state == JobState::Failed {
                        report.failed += 1;
                    }
                }
                JobState::Active | JobState::Paused if known => report.untouched += 1,
                JobState::Active | JobState::Paused => {
                    let resolved = self
                        .orphan(&job)
                        .await
                        .map_err(|err| OrchestratorError::registry("recover.orphan", err))?;
                    report.tally(&resolved);
                }
                JobState::Orphaned => {
                    let resolved = self
                        .resolve_orphan(&job)
                        .await
                        .map_err(|err| OrchestratorError::registry("recover.orphan", err))?;
                    report.tally(&resolved);
                }
                JobState::Complete | JobState::Failed => {}
            }
        }
        info!(
            resubmitted = report.resubmitted,
            untouched = report.untouched,
            completed = report.completed,
            failed = report.failed,
            "startup reconciliation finished"
        );
        Ok(report)
    }

    async fn submit(&self, job: DownloadJob) -> OrchestratorResult<DownloadJob> {
        let staging = self.staging_dir(job.id);
        let accepted = self
            .bounded("add_fetch", self.daemon.add_fetch(&job.source_uri, &staging))
            .await;
        let daemon_id = match accepted {
            Ok(daemon_id) => daemon_id,
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    error = %err,
                    detail = %err.detail(),
                    "daemon did not accept server fetch"
                );
                let failed = self
                    .fail(&job, FailureReason::DaemonRejected(err.detail()))
                    .await;
                return self.settle(job.id, failed, "enqueue.reject").await;
            }
        };

        match self
            .registry
            .assign_daemon_id(job.id, JobState::Queued, daemon_id.clone())
            .await
        {
            Ok(_) => {}
            Err(RegistryError::StaleState { .. } | RegistryError::DaemonIdAssigned { .. }) => {
                return self.abandon(job.id, &daemon_id).await;
            }
            Err(err) => return Err(OrchestratorError::registry("enqueue.assign", err)),
        }
        match self
            .registry
            .transition(job.id, JobState::Queued, JobState::Active, None)
            .await
        {
            Ok(active) => {
                self.announce(&active);
                Ok(active)
            }
            Err(RegistryError::StaleState { .. }) => self.abandon(job.id, &daemon_id).await,
            Err(err) => Err(OrchestratorError::registry("enqueue.activate", err)),
        }
    }

    /// The job was cancelled while the daemon was accepting it.
    async fn abandon(&self, id: JobId, daemon_id: &DaemonJobId) -> OrchestratorResult<DownloadJob> {
        info!(job_id = %id, daemon_id = %daemon_id, "job cancelled during hand-off; aborting daemon fetch");
        self.abort_quietly(id, daemon_id).await;
        self.get(id).await
    }

    async fn settle(
        &self,
        id: JobId,
        result: RegistryResult<DownloadJob>,
        operation: &'static str,
    ) -> OrchestratorResult<DownloadJob> {
        match result {
            Ok(job) => Ok(job),
            Err(RegistryError::StaleState { .. }) => self.get(id).await,
            Err(err) => Err(OrchestratorError::registry(operation, err)),
        }
    }

    async fn cancel_running(&self, job: &DownloadJob) -> RegistryResult<DownloadJob> {
        let Some(daemon_id) = job.tracked_daemon_id() else {
            return self.fail(job, FailureReason::Cancelled).await;
        };
        match self.bounded("abort", self.daemon.abort(daemon_id)).await {
            Ok(()) | Err(DaemonError::UnknownJob { .. }) => {
                self.fail(job, FailureReason::Cancelled).await
            }
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    error = %err,
                    detail = %err.detail(),
                    "daemon did not acknowledge cancellation; will retry"
                );
                if job.cancel_requested {
                    return Ok(job.clone());
                }
                self.registry.mark_cancel_requested(job.id, job.state).await
            }
        }
    }

    async fn retry_cancel(
        &self,
        state: &mut PollState,
        report: &mut PollReport,
        job: &DownloadJob,
        daemon_id: &DaemonJobId,
    ) {
        match self.bounded("abort", self.daemon.abort(daemon_id)).await {
            Ok(()) | Err(DaemonError::UnknownJob { .. }) => {
                state.clear(job.id);
                let cancelled = self.fail(job, FailureReason::Cancelled).await;
                if cancelled.is_ok() {
                    report.cancelled += 1;
                }
                record(report, job, cancelled.map(Some));
            }
            Err(err) => {
                let retry_in = state.defer(job.id, &self.settings);
                debug!(job_id = %job.id, error = %err, retry_in = ?retry_in, "pending cancellation still unacknowledged");
                report.deferred += 1;
            }
        }
    }

    async fn apply_status(
        &self,
        job: &DownloadJob,
        status: DaemonStatus,
    ) -> RegistryResult<Option<DownloadJob>> {
        if let Some(follow_up) = status.followed_by.into_iter().next()
            && job.tracked_daemon_id() != Some(&follow_up)
        {
            info!(
                job_id = %job.id,
                daemon_id = ?job.tracked_daemon_id(),
                follow_up = %follow_up,
                "daemon handed the payload to a follow-up fetch"
            );
            self.registry
                .follow_daemon_job(job.id, job.state, follow_up)
                .await?;
            return Ok(None);
        }
        let moved = match status.state {
            DaemonState::Complete => self.import(job, &status.files).await?,
            DaemonState::Error => {
                let reason = if job.cancel_requested {
                    FailureReason::Cancelled
                } else {
                    FailureReason::DaemonFailed(
                        status
                            .error_detail
                            .unwrap_or_else(|| "fetch failed".to_string()),
                    )
                };
                self.fail(job, reason).await?
            }
            DaemonState::Removed => {
                let reason = if job.cancel_requested {
                    FailureReason::Cancelled
                } else {
                    FailureReason::DaemonFailed("removed from daemon".to_string())
                };
                self.fail(job, reason).await?
            }
            DaemonState::Paused if job.state == JobState::Active => {
                self.advance(job, JobState::Paused, None).await?
            }
            DaemonState::Active | DaemonState::Waiting if job.state == JobState::Paused => {
                self.advance(job, JobState::Active, None).await?
            }
            DaemonState::Active | DaemonState::Waiting | DaemonState::Paused => {
                self.registry.touch(job.id, job.state).await?;
                return Ok(None);
            }
        };
        Ok(Some(moved))
    }

    async fn import(&self, job: &DownloadJob, files: &[PathBuf]) -> RegistryResult<DownloadJob> {
        let artifact = match files {
            [single] => single.clone(),
            _ => self.staging_dir(job.id),
        };
        self.import_artifact(job, &artifact).await
    }

    async fn import_artifact(
        &self,
        job: &DownloadJob,
        artifact: &Path,
    ) -> RegistryResult<DownloadJob> {
        match self
            .store
            .import(&job.owner_id, &job.destination_path, artifact)
            .await
        {
            Ok(()) => {
                let complete = self.advance(job, JobState::Complete, None).await?;
                self.clear_staging(job.id).await;
                Ok(complete)
            }
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    artifact = %artifact.display(),
                    error = %err,
                    "importing fetched artifact failed"
                );
                self.fail(job, FailureReason::ImportFailed(describe(&err)))
                    .await
            }
        }
    }

    /// Mark a running job the daemon has lost, then look for its artifact.
    async fn orphan(&self, job: &DownloadJob) -> RegistryResult<DownloadJob> {
        warn!(job_id = %job.id, daemon_id = ?job.tracked_daemon_id(), "daemon no longer knows job");
        let orphaned = self.advance(job, JobState::Orphaned, None).await?;
        self.resolve_orphan(&orphaned).await
    }

    async fn resolve_orphan(&self, job: &DownloadJob) -> RegistryResult<DownloadJob> {
        let present = self
            .store
            .contains(&job.owner_id, &job.destination_path)
            .await
            .unwrap_or_else(|err| {
                warn!(job_id = %job.id, error = %err, "store lookup failed during orphan recovery");
                false
            });
        if present {
            let complete = self.advance(job, JobState::Complete, None).await?;
            self.clear_staging(job.id).await;
            return Ok(complete);
        }
        match find_artifact(&self.staging_dir(job.id)).await {
            Some(artifact) => self.import_artifact(job, &artifact).await,
            None => self.fail(job, FailureReason::Orphaned).await,
        }
    }

    async fn advance(
        &self,
        job: &DownloadJob,
        next: JobState,
        error_detail: Option<String>,
    ) -> RegistryResult<DownloadJob> {
        let updated = self
            .registry
            .transition(job.id, job.state, next, error_detail)
            .await?;
        self.announce(&updated);
        Ok(updated)
    }

    async fn fail(&self, job: &DownloadJob, reason: FailureReason) -> RegistryResult<DownloadJob> {
        self.advance(job, JobState::Failed, Some(reason.to_string()))
            .await
    }

    fn announce(&self, job: &DownloadJob) {
        self.metrics.inc_job_transition(job.state.as_str());
        let event = match job.state {
            JobState::Complete => Event::JobCompleted {
                job_id: job.id.as_uuid(),
                owner_id: job.owner_id.clone(),
                destination_path: job.destination_path.clone(),
            },
            JobState::Failed => Event::JobFailed {
                job_id: job.id.as_uuid(),
                reason: job.error_detail.clone().unwrap_or_default(),
            },
            state => Event::JobStateChanged {
                job_id: job.id.as_uuid(),
                state,
            },
        };
        self.events.publish(event);
        info!(
            job_id = %job.id,
            owner = %job.owner_id,
            state = %job.state,
            error_detail = job.error_detail.as_deref().unwrap_or_default(),
            "server fetch transitioned"
        );
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> DaemonResult<T>
    where
        F: Future<Output = DaemonResult<T>>,
    {
        let limit = self.settings.daemon_timeout;
        let result = time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| {
                Err(DaemonError::Unreachable {
                    operation,
                    detail: format!("no answer within {limit:?}"),
                })
            });
        self.observe_daemon(&result);
        result
    }

    fn observe_daemon<T>(&self, result: &DaemonResult<T>) {
        match result {
            Err(err) if err.is_transient() => {
                self.metrics.inc_daemon_unreachable();
                self.set_degraded(true);
            }
            _ => self.set_degraded(false),
        }
    }

    fn set_degraded(&self, degraded: bool) {
        if self.degraded.swap(degraded, Ordering::SeqCst) == degraded {
            return;
        }
        if degraded {
            warn!(component = DAEMON_COMPONENT, "download daemon unreachable");
        } else {
            info!(component = DAEMON_COMPONENT, "download daemon reachable again");
        }
        let components = if degraded {
            vec![DAEMON_COMPONENT.to_string()]
        } else {
            Vec::new()
        };
        self.events.publish(Event::HealthChanged {
            degraded: components,
        });
    }

    async fn abort_quietly(&self, id: JobId, daemon_id: &DaemonJobId) {
        if let Err(err) = self.bounded("abort", self.daemon.abort(daemon_id)).await {
            warn!(job_id = %id, daemon_id = %daemon_id, error = %err, "daemon abort failed");
        }
    }

    async fn clear_staging(&self, id: JobId) {
        let dir = self.staging_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(job_id = %id, "staging directory removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(job_id = %id, dir = %dir.display(), error = %err, "staging cleanup failed"),
        }
    }

    async fn purge_expired(&self) -> u64 {
        let Some(cutoff) = TimeDelta::from_std(self.settings.completed_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        match self.registry.purge_completed_before(cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    info!(purged, "completed server fetches purged");
                }
                purged
            }
            Err(err) => {
                warn!(error = %err, "purging completed jobs failed");
                0
            }
        }
    }

    async fn refresh_active_gauge(&self) {
        if let Ok(jobs) = self.registry.list_non_terminal().await {
            let running = jobs.iter().filter(|job| job.state.is_running()).count();
            self.metrics
                .set_active_download_jobs(i64::try_from(running).unwrap_or(i64::MAX));
        }
    }
}

fn record(
    report: &mut PollReport,
    job: &DownloadJob,
    applied: RegistryResult<Option<DownloadJob>>,
) {
    match applied {
        Ok(Some(_)) => report.transitioned += 1,
        Ok(None) => {}
        Err(RegistryError::StaleState { actual, .. }) => {
            debug!(job_id = %job.id, actual = %actual, "job changed concurrently; skipped");
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "failed to apply daemon status");
        }
    }
}

/// A fully fetched artifact in `dir`: no aria2 control file may remain.
async fn find_artifact(dir: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext == CONTROL_FILE_EXTENSION)
        {
            return None;
        }
        found.push(path);
    }
    match found.len() {
        0 => None,
        1 => found.pop(),
        _ => Some(dir.to_path_buf()),
    }
}
