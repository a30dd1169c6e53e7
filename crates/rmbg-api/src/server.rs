//! Axum server and routes.

use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rmbg_types::{
    ComponentHealth, HealthComponents, HealthResponse, JobDescriptor, JobQueue, JobRecord,
    JobStatus, JobStore, SubmitRequest, TaskResponse, TaskStatusResponse,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/jpg", "image/png"];

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Queue submissions are routed to.
    pub queue_name: String,
    pub upload_dir: PathBuf,
    pub worker_liveness: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/task", post(handle_submit))
        .route("/task/:task_id", get(handle_status))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct Upload {
    filename: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// `file` and `request_data` parts of the submission form; other parts are ignored.
async fn read_form(mut multipart: Multipart) -> ApiResult<(Option<Upload>, Option<String>)> {
    let mut upload = None;
    let mut request_data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                let filename = field.file_name().map(String::from);
                let content_type = field.content_type().map(String::from);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                upload = Some(Upload {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            "request_data" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                request_data = Some(text);
            }
            _ => {}
        }
    }
    Ok((upload, request_data))
}

fn is_allowed_image(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .is_some_and(|ct| ALLOWED_CONTENT_TYPES.contains(&ct.as_str()))
}

fn parse_request_data(raw: Option<&str>) -> ApiResult<SubmitRequest> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => return Ok(SubmitRequest::default()),
    };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|_| ApiError::Validation("Invalid JSON in request_data".to_string()))?;
    let request: SubmitRequest = serde_json::from_value(value)
        .map_err(|e| ApiError::Validation(format!("Error parsing request data: {}", e)))?;
    if let Some(url) = request.callback_url.as_deref() {
        let valid = url.parse::<Uri>().is_ok_and(|uri| {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.host().is_some()
        });
        if !valid {
            return Err(ApiError::Validation(format!(
                "callback_url must be an absolute http(s) URL: {}",
                url
            )));
        }
    }
    Ok(request)
}

/// `upload_{unix_ts}_{8 hex}{ext}`, keeping the client's extension.
fn upload_filename(original: Option<&str>) -> String {
    let ext = original
        .and_then(|name| std::path::Path::new(name).extension())
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("upload_{}_{}{}", Utc::now().timestamp(), &id[..8], ext)
}

async fn remove_upload(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove rejected upload");
    }
}

async fn handle_submit(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let (upload, request_data) = read_form(multipart).await?;
    let upload =
        upload.ok_or_else(|| ApiError::Validation("Missing required 'file' field".to_string()))?;
    if !is_allowed_image(upload.content_type.as_deref()) {
        tracing::warn!(content_type = ?upload.content_type, "rejected upload");
        return Err(ApiError::Validation(
            "Invalid file type. Supported types: JPEG, PNG.".to_string(),
        ));
    }
    let request = parse_request_data(request_data.as_deref())?;

    let input_path = state
        .upload_dir
        .join(upload_filename(upload.filename.as_deref()));
    tokio::fs::write(&input_path, &upload.bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to save upload: {}", e)))?;

    let descriptor = JobDescriptor::new(&input_path, upload.filename, request.callback_spec());
    let task_id = descriptor.task_id.clone();

    if let Err(e) = state.store.create(JobRecord::pending(&descriptor)).await {
        remove_upload(&input_path).await;
        return Err(e.into());
    }
    if let Err(e) = state.queue.enqueue(&state.queue_name, &descriptor).await {
        if let Err(discard) = state.store.discard(&task_id).await {
            tracing::error!(%task_id, error = %discard, "failed to discard pending record");
        }
        remove_upload(&input_path).await;
        return Err(e.into());
    }

    tracing::info!(
        %task_id,
        input = %input_path.display(),
        callback = descriptor.callback.is_some(),
        "task submitted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskResponse {
            task_id,
            status: JobStatus::Pending,
        }),
    ))
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskStatusResponse>> {
    match state.store.get(&task_id).await? {
        Some(record) => Ok(Json(TaskStatusResponse::from(&record))),
        None => Err(ApiError::NotFound(task_id)),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (broker, worker) = match state.queue.ping().await {
        Err(e) => {
            tracing::warn!(error = %e, "health: broker unreachable");
            (ComponentHealth::Unhealthy, ComponentHealth::Unknown)
        }
        Ok(()) => {
            let worker = match state.queue.live_workers(state.worker_liveness).await {
                Ok(0) => ComponentHealth::Unhealthy,
                Ok(_) => ComponentHealth::Healthy,
                Err(e) => {
                    tracing::warn!(error = %e, "health: cannot read worker heartbeats");
                    ComponentHealth::Unknown
                }
            };
            (ComponentHealth::Healthy, worker)
        }
    };
    let components = HealthComponents {
        api: ComponentHealth::Healthy,
        worker,
        broker,
    };
    Json(HealthResponse {
        status: components.overall(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        components,
    })
}
