//! Dispatcher: consumes job descriptors and drives each job through
//! pending -> processing -> completed | failed.

use crate::pool::{ENV_CONCURRENCY, ENV_QUEUE, GPU_QUEUE};
use crate::storage::{LocalStorage, ResultStorage};
use crate::WorkerBinding;
use chrono::Utc;
use rmbg_callback::{CallbackClient, CallbackConfig, DeliveryError};
use rmbg_engine::ExecutionContext;
use rmbg_types::{
    CallbackNotice, Completion, Delivery, JobDescriptor, JobOutcome, JobQueue, JobRecord,
    JobStatus, JobStore, JobTimings, StoreError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// `RMBG_QUEUE`, `WORKER_CONCURRENCY`, `RESULT_DIR`, `WORKER_HEARTBEAT_SECS`,
/// `TASK_TIME_LIMIT_SECS`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue: String,
    /// Dispatch slots per worker process.
    pub concurrency: usize,
    pub result_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// Pause before retrying after the broker failed.
    pub retry_backoff: Duration,
    /// Upper bound on inference plus result storage for one job. Keep it below the
    /// queue visibility timeout.
    pub task_time_limit: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: GPU_QUEUE.to_string(),
            concurrency: 1,
            result_dir: PathBuf::from("/tmp/rmbg-results"),
            heartbeat_interval: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
            task_time_limit: Duration::from_secs(30 * 60),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            queue: var(ENV_QUEUE).unwrap_or(defaults.queue),
            concurrency: var(ENV_CONCURRENCY)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            result_dir: var("RESULT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.result_dir),
            heartbeat_interval: var("WORKER_HEARTBEAT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            retry_backoff: defaults.retry_backoff,
            task_time_limit: var("TASK_TIME_LIMIT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_time_limit),
        }
    }
}

/// Removes the job's input file when dropped, whichever way execution ended.
struct InputCleanup<'a> {
    task_id: &'a str,
    path: &'a Path,
}

impl Drop for InputCleanup<'_> {
    fn drop(&mut self) {
        match std::fs::remove_file(self.path) {
            Ok(()) => {
                tracing::debug!(task_id = self.task_id, path = %self.path.display(), "removed input file")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                task_id = self.task_id,
                path = %self.path.display(),
                error = %e,
                "failed to remove input file"
            ),
        }
    }
}

/// Unique output name: `{stem}_nobg_{unix_ts}_{8 hex}.png`.
pub fn output_filename(descriptor: &JobDescriptor) -> String {
    let stem = descriptor
        .original_filename
        .as_deref()
        .and_then(|name| Path::new(name).file_stem())
        .or_else(|| descriptor.input_path.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_nobg_{}_{}.png", stem, Utc::now().timestamp(), &suffix[..8])
}

/// One worker process's job loop. Cheap to share behind an `Arc`; every slot borrows the
/// same execution context.
pub struct Dispatcher {
    binding: WorkerBinding,
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    context: Arc<ExecutionContext>,
    storage: Arc<dyn ResultStorage>,
    callbacks: Arc<CallbackClient>,
}

impl Dispatcher {
    /// Dispatcher with local result storage and callbacks disabled.
    pub fn new(
        binding: WorkerBinding,
        config: DispatcherConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        context: Arc<ExecutionContext>,
    ) -> Result<Self, DeliveryError> {
        Ok(Self {
            binding,
            config,
            store,
            queue,
            context,
            storage: Arc::new(LocalStorage),
            callbacks: Arc::new(CallbackClient::new(CallbackConfig::disabled())?),
        })
    }

    pub fn with_storage(mut self, storage: Arc<dyn ResultStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackClient>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn binding(&self) -> WorkerBinding {
        self.binding
    }

    /// Run `concurrency` dispatch slots plus a heartbeat until `cancel` fires.
    ///
    /// A slot finishes the job it holds before stopping; jobs still queued stay queued.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let worker = self.binding.worker_id();
        tracing::info!(
            %worker,
            queue = %self.config.queue,
            slots = self.config.concurrency,
            "dispatcher started"
        );
        let mut tasks = JoinSet::new();
        for slot in 0..self.config.concurrency.max(1) {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.slot_loop(slot, cancel).await });
        }
        let this = Arc::clone(&self);
        let hb_cancel = cancel.clone();
        tasks.spawn(async move { this.heartbeat_loop(hb_cancel).await });

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(%worker, error = %e, "dispatcher task aborted");
            }
        }
        tracing::info!(%worker, "dispatcher stopped");
    }

    async fn slot_loop(&self, slot: usize, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue(&self.config.queue) => next,
            };
            match next {
                Ok(delivery) => self.handle(delivery).await,
                Err(e) => {
                    tracing::warn!(slot, error = %e, "dequeue failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }
        tracing::debug!(slot, "dispatch slot stopped");
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let worker = self.binding.worker_id();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.heartbeat(&worker).await {
                        tracing::warn!(%worker, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    /// Process one delivery and acknowledge it once the job is terminal. A store failure
    /// leaves the message unacknowledged so the broker redelivers it.
    pub async fn handle(&self, delivery: Delivery) {
        let task_id = delivery.descriptor.task_id.clone();
        match self.process(&delivery.descriptor, delivery.attempt).await {
            Ok(record) => {
                tracing::info!(%task_id, status = %record.status, attempt = delivery.attempt, "job settled")
            }
            Err(e) => {
                tracing::error!(%task_id, error = %e, "could not record job state, leaving for redelivery");
                return;
            }
        }
        match self.queue.ack(&delivery).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(%task_id, "lease expired before ack"),
            Err(e) => tracing::warn!(%task_id, error = %e, "ack failed"),
        }
    }

    /// Drive one job to a terminal state and return the terminal record.
    ///
    /// Redeliveries: a terminal record is returned unchanged; a record already in
    /// `processing` is re-executed; a missing record is recreated as pending first.
    pub async fn process(
        &self,
        descriptor: &JobDescriptor,
        attempt: u32,
    ) -> Result<JobRecord, StoreError> {
        let task_id = descriptor.task_id.as_str();
        let current = match self.store.get(task_id).await? {
            Some(record) => record,
            None => {
                tracing::warn!(task_id, "no record for delivered job, recreating it");
                let record = JobRecord::pending(descriptor);
                self.store.create(record.clone()).await?;
                record
            }
        };

        let started_at = match current.status {
            JobStatus::Pending => {
                let started_at = Utc::now();
                self.store.mark_processing(task_id, started_at).await?;
                started_at
            }
            JobStatus::Processing => {
                tracing::warn!(task_id, attempt, "job redelivered while processing, re-executing");
                current.started_at.unwrap_or_else(Utc::now)
            }
            JobStatus::Completed | JobStatus::Failed => {
                tracing::info!(task_id, status = %current.status, "job already terminal, skipping");
                drop(InputCleanup {
                    task_id,
                    path: &descriptor.input_path,
                });
                return Ok(current);
            }
        };
        if started_at < descriptor.submitted_at {
            tracing::warn!(
                task_id,
                submitted_at = %descriptor.submitted_at,
                %started_at,
                "clock skew between submitter and worker, queue_time clamped to 0"
            );
        }

        self.callbacks
            .notify(&CallbackNotice::processing(task_id), descriptor.callback.as_ref())
            .await;

        let cleanup = InputCleanup {
            task_id,
            path: &descriptor.input_path,
        };
        let (outcome, model_time) = self.execute(descriptor).await;
        drop(cleanup);

        let completed_at = Utc::now();
        let timings = JobTimings::measure(
            descriptor.submitted_at,
            started_at,
            completed_at,
            model_time,
        );
        if let JobOutcome::Failure { reason } = &outcome {
            tracing::error!(task_id, reason, "job failed");
        }
        let record = self
            .store
            .finish(
                task_id,
                Completion {
                    outcome,
                    completed_at,
                    timings,
                },
            )
            .await?;

        self.callbacks
            .notify(&CallbackNotice::from_record(&record), descriptor.callback.as_ref())
            .await;
        Ok(record)
    }

    /// Inference plus result storage, bounded by the task time limit. Returns the outcome
    /// and the time spent in the processor, if it ran to completion.
    ///
    /// On expiry the blocking processor call is not interrupted; it keeps the device until
    /// it returns, but the job is recorded as failed.
    async fn execute(&self, descriptor: &JobDescriptor) -> (JobOutcome, Option<Duration>) {
        let limit = self.config.task_time_limit;
        match tokio::time::timeout(limit, self.run_and_store(descriptor)).await {
            Ok(done) => done,
            Err(_) => {
                tracing::error!(
                    task_id = %descriptor.task_id,
                    limit_secs = limit.as_secs_f64(),
                    "job exceeded time limit"
                );
                (
                    JobOutcome::Failure {
                        reason: format!("task exceeded time limit of {}s", limit.as_secs_f64()),
                    },
                    None,
                )
            }
        }
    }

    async fn run_and_store(&self, descriptor: &JobDescriptor) -> (JobOutcome, Option<Duration>) {
        let task_id = descriptor.task_id.as_str();
        let output_filename = output_filename(descriptor);
        let output_path = self.config.result_dir.join(&output_filename);
        tracing::info!(
            task_id,
            worker = %self.binding.worker_id(),
            input = %descriptor.input_path.display(),
            "processing job"
        );

        let model_time = match self
            .context
            .run(&descriptor.input_path, &output_path)
            .await
        {
            Ok(elapsed) => elapsed,
            Err(e) => {
                return (
                    JobOutcome::Failure {
                        reason: format!("Error in background removal task: {}", e),
                    },
                    None,
                )
            }
        };

        match self.storage.store(&output_path, &output_filename).await {
            Ok(result_url) => (
                JobOutcome::Success {
                    result_url,
                    output_filename,
                },
                Some(model_time),
            ),
            Err(e) => (
                JobOutcome::Failure {
                    reason: format!("Error storing result ({}): {}", self.storage.kind(), e),
                },
                Some(model_time),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use rmbg_engine::{EngineError, ImageProcessor};
    use rmbg_queue::{InMemoryQueue, QueueConfig};
    use rmbg_store::InMemoryJobStore;
    use crate::storage::StorageError;
    use rmbg_types::{seconds_between, CallbackSpec, Device};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Copies the input to the output after a short pause.
    struct Passthrough {
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Passthrough {
        fn new() -> Self {
            Self::tracked(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
        }

        fn tracked(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
            Self {
                delay: Duration::from_millis(10),
                active,
                peak,
            }
        }
    }

    impl ImageProcessor for Passthrough {
        fn process(&mut self, input: &Path, output: &Path) -> Result<(), EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let res = std::fs::copy(input, output);
            self.active.fetch_sub(1, Ordering::SeqCst);
            res?;
            Ok(())
        }
    }

    struct Broken;

    impl ImageProcessor for Broken {
        fn process(&mut self, _input: &Path, _output: &Path) -> Result<(), EngineError> {
            Err(EngineError::Decode("unsupported image".to_string()))
        }
    }

    /// Holds the device longer than any test time limit.
    struct Stalled(Duration);

    impl ImageProcessor for Stalled {
        fn process(&mut self, _input: &Path, _output: &Path) -> Result<(), EngineError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    /// Result storage whose bucket refuses every upload.
    struct Rejects;

    #[async_trait::async_trait]
    impl ResultStorage for Rejects {
        async fn store(&self, _local: &Path, _object_name: &str) -> Result<String, StorageError> {
            Err(StorageError::HttpStatus {
                status: 403,
                body: "bucket is read-only".to_string(),
            })
        }

        fn kind(&self) -> &'static str {
            "remote"
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        store: InMemoryJobStore,
        queue: InMemoryQueue,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
            std::fs::create_dir_all(dir.path().join("results")).unwrap();
            Self {
                dir,
                store: InMemoryJobStore::new(),
                queue: InMemoryQueue::new(QueueConfig::default()),
            }
        }

        fn dispatcher(&self, ordinal: usize, processor: Box<dyn ImageProcessor>) -> Dispatcher {
            let config = DispatcherConfig {
                result_dir: self.dir.path().join("results"),
                heartbeat_interval: Duration::from_millis(50),
                retry_backoff: Duration::from_millis(20),
                ..DispatcherConfig::default()
            };
            Dispatcher::new(
                WorkerBinding::assign(ordinal, 0),
                config,
                Arc::new(self.store.clone()),
                Arc::new(self.queue.clone()),
                Arc::new(ExecutionContext::new(Device::Cpu, processor)),
            )
            .unwrap()
        }

        /// Persist an input and a pending record, as the API does on submission.
        async fn submit(&self, name: &str, callback: Option<CallbackSpec>) -> JobDescriptor {
            let input = self.dir.path().join("uploads").join(format!(
                "upload_{}_{}.png",
                Utc::now().timestamp(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ));
            std::fs::write(&input, b"image bytes").unwrap();
            let descriptor = JobDescriptor::new(&input, Some(name.to_string()), callback);
            self.store
                .create(JobRecord::pending(&descriptor))
                .await
                .unwrap();
            descriptor
        }
    }

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn callback_endpoint(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(seen): State<Seen>, Json(body): Json<serde_json::Value>| async move {
                        seen.lock().await.push(body);
                        status
                    },
                ),
            )
            .with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), seen)
    }

    fn enabled_callbacks() -> Arc<CallbackClient> {
        Arc::new(CallbackClient::new(CallbackConfig::default()).unwrap())
    }

    #[test]
    fn output_names_keep_stem_and_are_unique() {
        let d = JobDescriptor::new("/tmp/upload_1_abc.jpg", Some("cat.photo.jpg".into()), None);
        let a = output_filename(&d);
        let b = output_filename(&d);
        assert!(a.starts_with("cat.photo_nobg_"));
        assert!(a.ends_with(".png"));
        assert_ne!(a, b);

        let d = JobDescriptor::new("/tmp/upload_1_abc.jpg", Some("../../etc/passwd".into()), None);
        assert!(output_filename(&d).starts_with("passwd_nobg_"));

        let d = JobDescriptor::new("/tmp/upload_1_abc.jpg", None, None);
        assert!(output_filename(&d).starts_with("upload_1_abc_nobg_"));
    }

    #[tokio::test]
    async fn successful_job_completes_and_removes_input() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Passthrough::new()));
        let descriptor = h.submit("cat.jpg", None).await;

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        let url = record.result_url.clone().unwrap();
        assert!(url.starts_with("file://"));
        let output = record.output_filename.clone().unwrap();
        assert!(output.starts_with("cat_nobg_"));
        assert!(h.dir.path().join("results").join(&output).exists());
        assert!(record.error.is_none());
        let timings = record.timings.unwrap();
        let started = record.started_at.unwrap();
        assert_eq!(
            timings.queue_time,
            seconds_between(record.queued_at, started).max(0.0)
        );
        assert_eq!(
            timings.processing_time,
            seconds_between(started, record.completed_at.unwrap()).max(0.0)
        );
        assert!(timings.model_time.is_some());
        assert!(!descriptor.input_path.exists());
        assert_eq!(h.store.get(&descriptor.task_id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn failing_processor_marks_job_failed_and_removes_input() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Broken));
        let descriptor = h.submit("cat.jpg", None).await;

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.contains("unsupported image"));
        assert!(record.result_url.is_none());
        let timings = record.timings.unwrap();
        assert!(timings.processing_time >= 0.0);
        assert!(timings.model_time.is_none());
        assert!(!descriptor.input_path.exists());
    }

    #[tokio::test]
    async fn callbacks_report_processing_then_terminal() {
        let h = Harness::new();
        let (url, seen) = callback_endpoint(StatusCode::OK).await;
        let dispatcher = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_callbacks(enabled_callbacks());
        let mut custom = serde_json::Map::new();
        custom.insert("order_id".to_string(), serde_json::json!("456"));
        let descriptor = h
            .submit(
                "cat.jpg",
                Some(CallbackSpec {
                    url,
                    auth_token: Some("token123".to_string()),
                    custom_data: Some(custom),
                }),
            )
            .await;

        dispatcher.process(&descriptor, 1).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["status"], "processing");
        assert_eq!(seen[1]["status"], "completed");
        assert_eq!(seen[1]["task_id"], descriptor.task_id.as_str());
        assert!(seen[1]["result_url"].is_string());
        assert_eq!(seen[1]["order_id"], "456");
    }

    #[tokio::test]
    async fn failing_callback_endpoint_does_not_change_outcome() {
        let h = Harness::new();
        let (url, seen) = callback_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
        let dispatcher = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_callbacks(enabled_callbacks());
        let descriptor = h
            .submit(
                "cat.jpg",
                Some(CallbackSpec {
                    url,
                    auth_token: None,
                    custom_data: None,
                }),
            )
            .await;

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.result_url.is_some());
        assert_eq!(seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn disabling_callbacks_gives_the_same_result_shape() {
        let h = Harness::new();
        let (url, _seen) = callback_endpoint(StatusCode::OK).await;
        let spec = CallbackSpec {
            url,
            auth_token: None,
            custom_data: None,
        };
        let with = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_callbacks(enabled_callbacks());
        let without = h.dispatcher(1, Box::new(Passthrough::new()));

        let a = with
            .process(&h.submit("a.png", Some(spec.clone())).await, 1)
            .await
            .unwrap();
        let b = without
            .process(&h.submit("a.png", Some(spec)).await, 1)
            .await
            .unwrap();

        assert_eq!(a.status, b.status);
        assert_eq!(a.result_url.is_some(), b.result_url.is_some());
        assert_eq!(
            a.timings.map(|t| t.model_time.is_some()),
            b.timings.map(|t| t.model_time.is_some())
        );
    }

    #[tokio::test]
    async fn terminal_job_is_not_reprocessed() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Passthrough::new()));
        let descriptor = h.submit("cat.jpg", None).await;
        let first = dispatcher.process(&descriptor, 1).await.unwrap();

        let again = dispatcher.process(&descriptor, 2).await.unwrap();

        assert_eq!(first, again);
        let files = std::fs::read_dir(h.dir.path().join("results")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn redelivery_while_processing_reexecutes_once() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Passthrough::new()));
        let descriptor = h.submit("cat.jpg", None).await;
        let started = Utc::now();
        h.store
            .mark_processing(&descriptor.task_id, started)
            .await
            .unwrap();

        let record = dispatcher.process(&descriptor, 2).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.started_at, Some(started));
    }

    #[tokio::test]
    async fn missing_record_is_recreated() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Passthrough::new()));
        let input = h.dir.path().join("uploads").join("orphan.png");
        std::fs::write(&input, b"bytes").unwrap();
        let descriptor = JobDescriptor::new(&input, None, None);

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert!(!input.exists());
    }

    #[tokio::test]
    async fn missing_input_fails_the_job() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(0, Box::new(Passthrough::new()));
        let descriptor = h.submit("cat.jpg", None).await;
        std::fs::remove_file(&descriptor.input_path).unwrap();

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn job_over_time_limit_fails_and_removes_input() {
        let h = Harness::new();
        let mut dispatcher = h.dispatcher(0, Box::new(Stalled(Duration::from_millis(800))));
        dispatcher.config.task_time_limit = Duration::from_millis(100);
        let descriptor = h.submit("cat.jpg", None).await;

        let started = tokio::time::Instant::now();
        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("task exceeded time limit of 0.1s")
        );
        assert!(record.result_url.is_none());
        assert!(record.timings.unwrap().model_time.is_none());
        assert!(!descriptor.input_path.exists());
        assert_eq!(
            h.store.get(&descriptor.task_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn storage_failure_keeps_model_time_and_output() {
        let h = Harness::new();
        let dispatcher = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_storage(Arc::new(Rejects));
        let descriptor = h.submit("cat.jpg", None).await;

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.clone().unwrap();
        assert!(error.contains("Error storing result (remote)"), "{}", error);
        assert!(error.contains("403"));
        assert!(record.result_url.is_none());
        let timings = record.timings.unwrap();
        assert!(timings.model_time.is_some());
        assert_eq!(
            timings.queue_time,
            seconds_between(record.queued_at, record.started_at.unwrap()).max(0.0)
        );
        assert!(!descriptor.input_path.exists());
        let outputs: Vec<_> = std::fs::read_dir(h.dir.path().join("results"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].starts_with("cat_nobg_"));
    }

    #[tokio::test]
    async fn deployment_callback_url_covers_jobs_without_their_own() {
        let h = Harness::new();
        let (url, seen) = callback_endpoint(StatusCode::OK).await;
        let callbacks = CallbackClient::new(CallbackConfig {
            url: Some(url),
            ..CallbackConfig::default()
        })
        .unwrap();
        let dispatcher = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_callbacks(Arc::new(callbacks));
        let descriptor = h.submit("cat.jpg", None).await;

        dispatcher.process(&descriptor, 1).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["status"], "processing");
        assert_eq!(seen[1]["status"], "completed");
        assert_eq!(seen[1]["task_id"], descriptor.task_id.as_str());
    }

    #[tokio::test]
    async fn no_callback_target_sends_nothing() {
        let h = Harness::new();
        let (_url, seen) = callback_endpoint(StatusCode::OK).await;
        let dispatcher = h
            .dispatcher(0, Box::new(Passthrough::new()))
            .with_callbacks(enabled_callbacks());
        let descriptor = h.submit("cat.jpg", None).await;

        let record = dispatcher.process(&descriptor, 1).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_drain_the_queue_without_exceeding_pool_size() {
        let h = Harness::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let workers = 2;
        let cancel = CancellationToken::new();
        let mut running = Vec::new();
        for ordinal in 0..workers {
            let processor = Passthrough::tracked(Arc::clone(&active), Arc::clone(&peak));
            let dispatcher = Arc::new(h.dispatcher(ordinal, Box::new(processor)));
            running.push(tokio::spawn(dispatcher.run(cancel.clone())));
        }

        let mut ids = Vec::new();
        for i in 0..8 {
            let descriptor = h.submit(&format!("img{}.png", i), None).await;
            h.queue.enqueue(GPU_QUEUE, &descriptor).await.unwrap();
            ids.push(descriptor.task_id);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while h.store.count_in(JobStatus::Completed).await < ids.len() {
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(peak.load(Ordering::SeqCst) <= workers);
        assert!(h.queue.live_workers(Duration::from_secs(5)).await.unwrap() >= 1);
        cancel.cancel();
        for r in running {
            r.await.unwrap();
        }
        assert_eq!(h.queue.depth(GPU_QUEUE).await.unwrap(), 0);
    }
}
