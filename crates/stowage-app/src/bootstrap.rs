//! Service bootstrap: dependency wiring, startup reconciliation and the poll
//! task lifecycle.

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use stowage_aria2::{Aria2Client, Aria2Config};
use stowage_config::TransferConfig;
use stowage_events::EventBus;
use stowage_runtime::{JobRegistry, JobStore, MemoryJobStore, PgJobStore};
use stowage_store::LocalFileStore;
use stowage_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, Metrics, record_app_mode};
use stowage_transfer::ClientTransfer;
use stowage_transfer_core::{DaemonControl, FileStore, RateConfig};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::facade::TransferFacade;
use crate::orchestrator::{DownloadOrchestrator, OrchestratorSettings};

const DATABASE_URL: &str = "DATABASE_URL";
const MAX_DB_CONNECTIONS: u32 = 5;

/// Dependencies required to bootstrap the service.
pub struct BootstrapDependencies {
    config: TransferConfig,
    events: EventBus,
    metrics: Metrics,
    jobs: Arc<dyn JobStore>,
    daemon: Arc<dyn DaemonControl>,
    store: Arc<dyn FileStore>,
}

impl BootstrapDependencies {
    /// Inject every collaborator explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error when the metrics registry cannot be built.
    pub fn new(
        config: TransferConfig,
        jobs: Arc<dyn JobStore>,
        daemon: Arc<dyn DaemonControl>,
        store: Arc<dyn FileStore>,
    ) -> AppResult<Self> {
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        Ok(Self {
            config,
            events: EventBus::new(),
            metrics,
            jobs,
            daemon,
            store,
        })
    }

    /// Ephemeral wiring: in-memory registry over the supplied daemon and store.
    ///
    /// # Errors
    ///
    /// Returns an error when the metrics registry cannot be built.
    pub fn in_memory(
        config: TransferConfig,
        daemon: Arc<dyn DaemonControl>,
        store: Arc<dyn FileStore>,
    ) -> AppResult<Self> {
        Self::new(config, Arc::new(MemoryJobStore::new()), daemon, store)
    }

    /// Construct production dependencies from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when configuration is missing or invalid, or when the
    /// database or daemon client cannot be set up.
    pub async fn from_env() -> AppResult<Self> {
        let config =
            TransferConfig::from_env().map_err(|err| AppError::config("config.from_env", err))?;
        let database_url = config
            .require_database_url()
            .map_err(|_| AppError::MissingEnv { name: DATABASE_URL })?;

        let pool = PgPoolOptions::new()
            .max_connections(MAX_DB_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|source| AppError::Database {
                operation: "database.connect",
                source,
            })?;
        let jobs = PgJobStore::new(pool)
            .await
            .map_err(|err| AppError::runtime("job_store.new", err))?;

        let store = LocalFileStore::new(config.store_root.clone(), config.owner_quota_bytes);
        let daemon = Aria2Client::new(Aria2Config {
            endpoint: config.aria2_rpc_url.clone(),
            secret: config.aria2_secret.clone(),
            timeout: config.daemon_timeout,
        })
        .map_err(|source| AppError::Daemon {
            operation: "aria2.new",
            source,
        })?;

        Self::new(config, Arc::new(jobs), Arc::new(daemon), Arc::new(store))
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Wire file store, daemon client and registry into the shared facade.
    ///
    /// Consumes the dependencies, so a process builds exactly one orchestrator
    /// and one poll lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured default rate is zero.
    pub fn assemble(self) -> AppResult<Arc<TransferFacade>> {
        let Self {
            config,
            events,
            metrics,
            jobs,
            daemon,
            store,
        } = self;
        let rate = RateConfig::new(config.default_rate_bps).map_err(|_| {
            AppError::InvalidConfig {
                field: "default_rate_bps",
                reason: "must be positive",
                value: Some(config.default_rate_bps.to_string()),
            }
        })?;
        let transfer = ClientTransfer::new(
            Arc::clone(&store),
            rate,
            events.clone(),
            metrics.clone(),
        );
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            Arc::new(JobRegistry::new(jobs)),
            daemon,
            store,
            events.clone(),
            metrics.clone(),
            OrchestratorSettings::from_config(&config),
        ));
        Ok(Arc::new(TransferFacade::new(
            transfer,
            orchestrator,
            events,
            metrics,
        )))
    }
}

/// Entry point for the service boot sequence.
///
/// # Errors
///
/// Returns an error if dependency construction or startup fails.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env().await?;
    let logging = LoggingConfig {
        format: LogFormat::from_label(dependencies.config.log_format.as_deref()),
        ..LoggingConfig::default()
    };
    stowage_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new("bootstrap");

    Box::pin(serve(dependencies, shutdown_signal())).await
}

/// Boot sequence over injected dependencies; runs until `shutdown` resolves.
///
/// Recovery runs to completion before the poll task starts, so the first
/// poll pass never races startup reconciliation.
///
/// # Errors
///
/// Returns an error when the storage directories cannot be created, the
/// facade cannot be assembled, or startup reconciliation fails.
pub async fn serve<F>(dependencies: BootstrapDependencies, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    info!("stowage bootstrap starting");
    let config = dependencies.config().clone();
    for dir in [&config.store_root, &config.staging_root] {
        fs::create_dir_all(dir)
            .await
            .map_err(|err| AppError::io("storage.create_dir", dir, err))?;
    }

    let facade = dependencies.assemble()?;
    let orchestrator = Arc::clone(facade.orchestrator());

    record_app_mode("recovering");
    let recovery = orchestrator
        .recover_on_startup()
        .await
        .map_err(|err| AppError::orchestrator("recover_on_startup", err))?;
    if recovery.deferred {
        warn!("download daemon unreachable at startup; reconciliation continues in the poll loop");
    }

    record_app_mode("serving");
    let poller = orchestrator.spawn_poller(config.poll_interval);
    info!(
        poll_interval = ?config.poll_interval,
        store_root = %config.store_root.display(),
        "stowage ready"
    );

    shutdown.await;
    info!("shutdown requested");

    if !poller.is_finished() {
        poller.abort();
    }
    if let Err(err) = poller.await
        && !err.is_cancelled()
    {
        warn!(error = %err, "download poller join failed");
    }
    info!("stowage shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
