//! Process roles: API server, single worker, supervisor (`all`) and connectivity checks.

use crate::config::Settings;
use crate::server::{self, AppState};
use rmbg_callback::CallbackClient;
use rmbg_engine::{BorderMatte, ExecutionContext};
use rmbg_queue::SqliteQueue;
use rmbg_store::SqliteJobStore;
use rmbg_types::{JobQueue, JobStore};
use rmbg_worker::{detect_devices, Dispatcher, WorkerBinding, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Job store and queue shared by the API and every worker process.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
}

impl Backends {
    /// SQLite store and queue in the configured database file.
    pub fn open(settings: &Settings) -> Result<Self, BoxError> {
        let store = SqliteJobStore::open(&settings.db_path)?;
        let queue = SqliteQueue::open(&settings.db_path, settings.queue)?;
        Ok(Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
        })
    }

    pub fn app_state(&self, settings: &Settings) -> Arc<AppState> {
        Arc::new(AppState {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            queue_name: settings.dispatcher.queue.clone(),
            upload_dir: settings.upload_dir.clone(),
            worker_liveness: settings.worker_liveness(),
        })
    }
}

/// Serve the HTTP API until `cancel` fires.
pub async fn serve_api(
    settings: &Settings,
    backends: &Backends,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let app = server::router(backends.app_state(settings));
    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("rmbg API listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("API stopped");
    Ok(())
}

/// Run one worker process: build its execution context once, then dispatch until
/// `cancel` fires.
pub async fn run_worker(
    settings: &Settings,
    backends: &Backends,
    binding: WorkerBinding,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    tracing::info!(worker = %binding.worker_id(), "initializing worker");
    let context = Arc::new(ExecutionContext::new(
        binding.device(),
        Box::new(BorderMatte::new(settings.engine)),
    ));
    let storage = settings.storage.build()?;
    let callbacks = Arc::new(CallbackClient::new(settings.callbacks.clone())?);
    let dispatcher = Dispatcher::new(
        binding,
        settings.dispatcher.clone(),
        Arc::clone(&backends.store),
        Arc::clone(&backends.queue),
        context,
    )?
    .with_storage(storage)
    .with_callbacks(callbacks);
    Arc::new(dispatcher).run(cancel).await;
    Ok(())
}

/// Broker, storage and directory checks. Fails on the first unusable component.
pub async fn run_checks(settings: &Settings, backends: &Backends) -> Result<(), BoxError> {
    backends.queue.ping().await?;
    tracing::info!("broker reachable");

    let probe = settings.upload_dir.join(".rmbg-write-check");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;
    tracing::info!(dir = %settings.upload_dir.display(), "upload directory writable");

    let storage = settings.storage.build()?;
    storage.check().await?;
    tracing::info!(kind = storage.kind(), "result storage reachable");
    Ok(())
}

/// Supervisor mode: one worker process per detected device, the API in this process,
/// workers stopped with a grace period when the API exits.
pub async fn run_all(
    settings: &Settings,
    backends: &Backends,
    skip_checks: bool,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    if skip_checks {
        tracing::info!("skipping startup checks");
    } else {
        run_checks(settings, backends).await?;
    }

    let devices = detect_devices().await;
    let mut pool = WorkerPool::current_exe(&settings.dispatcher.queue)?;
    pool.spawn_workers(devices, settings.dispatcher.concurrency)?;
    tracing::info!(workers = pool.handles().len(), devices, "worker pool started");

    let api_cancel = cancel.clone();
    let api = serve_api(settings, backends, api_cancel);
    tokio::pin!(api);
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    let result = loop {
        tokio::select! {
            res = &mut api => break res,
            _ = reap.tick() => {
                for (binding, status) in pool.reap_exited() {
                    tracing::error!(
                        worker = %binding.worker_id(),
                        %status,
                        "worker exited unexpectedly and will not be restarted"
                    );
                }
            }
        }
    };

    tracing::info!("stopping worker pool");
    pool.shutdown(settings.shutdown_grace).await;
    result
}
