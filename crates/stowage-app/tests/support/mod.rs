#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stowage_app::{DownloadOrchestrator, OrchestratorSettings};
use stowage_events::{Event, EventBus};
use stowage_runtime::{JobRegistry, MemoryJobStore};
use stowage_telemetry::Metrics;
use stowage_test_support::mocks::{MemoryFileStore, StubDaemon};
use stowage_transfer_core::{DaemonJobId, DownloadJob};
use tempfile::TempDir;

pub const OWNER: &str = "alice";
pub const SOURCE: &str = "https://mirror.example/debian.iso";

pub struct Harness {
    pub daemon: Arc<StubDaemon>,
    pub store: Arc<MemoryFileStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub events: EventBus,
    pub metrics: Metrics,
    pub settings: OrchestratorSettings,
    pub orchestrator: Arc<DownloadOrchestrator>,
    _staging: TempDir,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut OrchestratorSettings)) -> Result<Self> {
        let staging = TempDir::new()?;
        let mut settings = OrchestratorSettings {
            staging_root: staging.path().to_path_buf(),
            poll_interval: Duration::from_secs(1),
            daemon_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(8),
            completed_retention: Duration::from_secs(3_600),
        };
        tweak(&mut settings);

        let daemon = Arc::new(StubDaemon::new());
        let store = Arc::new(MemoryFileStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let events = EventBus::new();
        let metrics = Metrics::new()?;
        let orchestrator = build(&jobs, &daemon, &store, &events, &metrics, &settings);
        Ok(Self {
            daemon,
            store,
            jobs,
            events,
            metrics,
            settings,
            orchestrator,
            _staging: staging,
        })
    }

    /// A fresh orchestrator over the same registry, daemon and store, as after
    /// a process restart.
    pub fn restart(&self) -> Arc<DownloadOrchestrator> {
        build(
            &self.jobs,
            &self.daemon,
            &self.store,
            &self.events,
            &self.metrics,
            &self.settings,
        )
    }

    pub fn registry(&self) -> JobRegistry {
        JobRegistry::new(self.jobs.clone())
    }

    pub fn write_artifact(&self, job: &DownloadJob, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.orchestrator.staging_dir(job.id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Every event published so far.
    pub async fn published(&self) -> Vec<Event> {
        let Some(last) = self.events.last_event_id() else {
            return Vec::new();
        };
        let mut stream = self.events.subscribe(Some(0));
        let mut seen = Vec::new();
        while let Some(envelope) = stream.next().await {
            seen.push(envelope.event);
            if envelope.id >= last {
                break;
            }
        }
        seen
    }
}

fn build(
    jobs: &Arc<MemoryJobStore>,
    daemon: &Arc<StubDaemon>,
    store: &Arc<MemoryFileStore>,
    events: &EventBus,
    metrics: &Metrics,
    settings: &OrchestratorSettings,
) -> Arc<DownloadOrchestrator> {
    Arc::new(DownloadOrchestrator::new(
        Arc::new(JobRegistry::new(jobs.clone())),
        daemon.clone(),
        store.clone(),
        events.clone(),
        metrics.clone(),
        settings.clone(),
    ))
}

pub fn daemon_id(job: &DownloadJob) -> Result<DaemonJobId> {
    job.daemon_id.clone().context("job has no daemon id")
}
