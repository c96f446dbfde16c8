//! Infrastructure wiring: job store, bus, orchestrator, workers, and the
//! background dispatcher/reclaimer threads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::runtime::Handle;

use assetflow_events::InMemoryEventBus;
use assetflow_infra::{
    JobStore, Orchestrator, PostgresJobStore, Reclaimer, WorkerHandle,
    clients::{HttpObjectStore, HttpTransformClient, ObjectStore, TransformClient},
    config::AppConfig,
    dispatch::{Dispatcher, HttpWorkerInvoker, WorkerInvoker},
    store::InMemoryJobStore,
    workers::{MigrationWorker, ThumbnailWorker},
};
use assetflow_lifecycle::TransitionEvent;

pub type JobBus = Arc<InMemoryEventBus<TransitionEvent>>;
pub type JobOrchestrator = Orchestrator<dyn JobStore, JobBus>;

/// Headroom on top of the slowest worker before a dispatch call is abandoned.
const DISPATCH_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

pub struct AppServices {
    pub orchestrator: Arc<JobOrchestrator>,
    pub bus: JobBus,
    pub migration: MigrationWorker<dyn JobStore, JobBus>,
    pub thumbnail: ThumbnailWorker<dyn JobStore, JobBus>,
    pub dispatcher: Arc<Dispatcher<dyn JobStore>>,
    pub reclaimer: Arc<Reclaimer<dyn JobStore, JobBus>>,
    /// Shared bearer token for worker and admin routes; `None` leaves them open.
    pub worker_token: Option<String>,
}

impl AppServices {
    /// Start the dispatcher and reclaimer threads. Both stop when their handle
    /// is shut down.
    pub fn spawn_background(&self, runtime: Handle) -> anyhow::Result<Vec<WorkerHandle>> {
        let dispatcher = Arc::clone(&self.dispatcher)
            .spawn(&self.bus, runtime.clone())
            .context("spawning dispatcher thread")?;
        let reclaimer = Arc::clone(&self.reclaimer)
            .spawn(runtime)
            .context("spawning reclaimer thread")?;
        Ok(vec![dispatcher, reclaimer])
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store = build_store(config).await?;
    let bus: JobBus = Arc::new(InMemoryEventBus::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.orchestrator(),
    ));

    let http = reqwest::Client::builder()
        .build()
        .context("building http client")?;

    let objects: Option<Arc<dyn ObjectStore>> = match config.object_store.url.as_deref() {
        Some(endpoint) => Some(Arc::new(HttpObjectStore::new(
            http.clone(),
            endpoint,
            &config.object_store.durable_base_url(),
            config.object_store.token.clone(),
        ))),
        None => {
            tracing::warn!("OBJECT_STORE_URL not set; workers will report configuration errors");
            None
        }
    };
    let transform: Option<Arc<dyn TransformClient>> = match config.thumbnail.transform_url.as_deref() {
        Some(endpoint) => Some(Arc::new(HttpTransformClient::new(http, endpoint))),
        None => {
            tracing::warn!("TRANSFORM_URL not set; thumbnail worker will report configuration errors");
            None
        }
    };

    if config.dispatch.worker_base_url.is_none() {
        tracing::warn!("WORKER_BASE_URL not set; pending work will be recorded as undispatched");
    }
    let dispatch_timeout = config
        .retry
        .migration_worker_timeout
        .max(config.thumbnail.worker_timeout)
        + DISPATCH_TIMEOUT_MARGIN;
    let invoker: Arc<dyn WorkerInvoker> = Arc::new(HttpWorkerInvoker::new(
        config.dispatch.worker_base_url.clone(),
        config.dispatch.worker_token.clone(),
        dispatch_timeout,
    )?);

    Ok(AppServices {
        migration: MigrationWorker::new(
            Arc::clone(&orchestrator),
            objects.clone(),
            config.retry.migration_worker_timeout,
        ),
        thumbnail: ThumbnailWorker::new(
            Arc::clone(&orchestrator),
            objects,
            transform,
            config.thumbnail.worker_timeout,
        ),
        dispatcher: Arc::new(Dispatcher::new(store, invoker)),
        reclaimer: Arc::new(Reclaimer::new(
            Arc::clone(&orchestrator),
            config.reclaimer.clone(),
        )),
        orchestrator,
        bus,
        worker_token: config.dispatch.worker_token.clone(),
    })
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    if !config.use_persistent_stores {
        tracing::info!("using in-memory job store");
        return Ok(InMemoryJobStore::arc());
    }
    let url = config
        .database_url
        .as_deref()
        .context("USE_PERSISTENT_STORES=true requires DATABASE_URL")?;
    let store = PostgresJobStore::connect(url)
        .await
        .context("connecting to postgres")?;
    store.ensure_schema().await.context("creating job schema")?;
    tracing::info!("using postgres job store");
    Ok(Arc::new(store))
}
