//! Prometheus-backed metrics registry and snapshot helpers.

use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    uploads_total: IntCounterVec,
    downloads_started_total: IntCounter,
    download_job_transitions_total: IntCounterVec,
    daemon_unreachable_total: IntCounter,
    active_download_jobs: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Server fetches currently held by the daemon.
    pub active_download_jobs: i64,
    /// Direct downloads handed to clients.
    pub downloads_started_total: u64,
    /// Daemon calls that failed with a transient error.
    pub daemon_unreachable_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let uploads_total = IntCounterVec::new(
            Opts::new("uploads_total", "Direct uploads by outcome"),
            &["outcome"],
        )
        .map_err(|source| collector_error("uploads_total", source))?;
        let downloads_started_total = IntCounter::with_opts(Opts::new(
            "downloads_started_total",
            "Direct downloads handed to clients",
        ))
        .map_err(|source| collector_error("downloads_started_total", source))?;
        let download_job_transitions_total = IntCounterVec::new(
            Opts::new(
                "download_job_transitions_total",
                "Server fetch state transitions by target state",
            ),
            &["state"],
        )
        .map_err(|source| collector_error("download_job_transitions_total", source))?;
        let daemon_unreachable_total = IntCounter::with_opts(Opts::new(
            "daemon_unreachable_total",
            "Daemon calls that could not reach the daemon",
        ))
        .map_err(|source| collector_error("daemon_unreachable_total", source))?;
        let active_download_jobs = IntGauge::with_opts(Opts::new(
            "active_download_jobs",
            "Server fetches currently active or paused",
        ))
        .map_err(|source| collector_error("active_download_jobs", source))?;

        register(&registry, "uploads_total", &uploads_total)?;
        register(&registry, "downloads_started_total", &downloads_started_total)?;
        register(
            &registry,
            "download_job_transitions_total",
            &download_job_transitions_total,
        )?;
        register(&registry, "daemon_unreachable_total", &daemon_unreachable_total)?;
        register(&registry, "active_download_jobs", &active_download_jobs)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                uploads_total,
                downloads_started_total,
                download_job_transitions_total,
                daemon_unreachable_total,
                active_download_jobs,
            }),
        })
    }

    /// Count a finished upload under its outcome label.
    pub fn inc_upload(&self, outcome: &str) {
        self.inner
            .uploads_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count a direct download handed to a client.
    pub fn inc_download_started(&self) {
        self.inner.downloads_started_total.inc();
    }

    /// Count a job transition into `state`.
    pub fn inc_job_transition(&self, state: &str) {
        self.inner
            .download_job_transitions_total
            .with_label_values(&[state])
            .inc();
    }

    /// Count a daemon call that failed transiently.
    pub fn inc_daemon_unreachable(&self) {
        self.inner.daemon_unreachable_total.inc();
    }

    /// Set the active download jobs gauge.
    pub fn set_active_download_jobs(&self, count: i64) {
        self.inner.active_download_jobs.set(count);
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_download_jobs: self.inner.active_download_jobs.get(),
            downloads_started_total: self.inner.downloads_started_total.get(),
            daemon_unreachable_total: self.inner.daemon_unreachable_total.get(),
        }
    }
}

const fn collector_error(name: &'static str, source: prometheus::Error) -> TelemetryError {
    TelemetryError::MetricsCollector { name, source }
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
