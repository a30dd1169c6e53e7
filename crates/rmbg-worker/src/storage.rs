//! Result storage: where a processed image ends up and the URL recorded for it.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("result file unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Persist a finished output and return a URL addressing it.
#[async_trait]
pub trait ResultStorage: Send + Sync {
    async fn store(&self, local: &Path, object_name: &str) -> Result<String, StorageError>;

    /// Connectivity probe used by `rmbg check`.
    async fn check(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn kind(&self) -> &'static str;
}

/// Keeps results in the local result directory and reports `file://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

#[async_trait]
impl ResultStorage for LocalStorage {
    async fn store(&self, local: &Path, _object_name: &str) -> Result<String, StorageError> {
        let absolute = tokio::fs::canonicalize(local).await?;
        Ok(format!("file://{}", absolute.display()))
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

/// Uploads results with an authenticated `PUT {endpoint}/{bucket}/results/{object}`.
/// The local copy is removed after a successful upload.
pub struct RemoteStorage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: String,
}

impl RemoteStorage {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn object_url(&self, object_name: &str) -> String {
        format!("{}/{}/results/{}", self.endpoint, self.bucket, object_name)
    }
}

#[async_trait]
impl ResultStorage for RemoteStorage {
    async fn store(&self, local: &Path, object_name: &str) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(local).await?;
        let url = self.object_url(object_name);
        let res = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        if let Err(e) = tokio::fs::remove_file(local).await {
            tracing::warn!(path = %local.display(), error = %e, "failed to remove uploaded result");
        }
        Ok(url)
    }

    async fn check(&self) -> Result<(), StorageError> {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        let res = self.client.head(&url).bearer_auth(&self.token).send().await?;
        if res.status().is_server_error() {
            return Err(StorageError::HttpStatus {
                status: res.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}

/// `STORAGE_ENDPOINT`, `STORAGE_BUCKET`, `STORAGE_TOKEN`, `STORAGE_TIMEOUT_SECS`.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: "rmbg-results".to_string(),
            token: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            endpoint: non_empty("STORAGE_ENDPOINT"),
            bucket: non_empty("STORAGE_BUCKET").unwrap_or(defaults.bucket),
            token: non_empty("STORAGE_TOKEN"),
            timeout: non_empty("STORAGE_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    /// Remote storage when endpoint and token are both set, local paths otherwise.
    pub fn build(&self) -> Result<Arc<dyn ResultStorage>, StorageError> {
        match (&self.endpoint, &self.token) {
            (Some(endpoint), Some(token)) => {
                tracing::info!(endpoint, bucket = %self.bucket, "using remote result storage");
                Ok(Arc::new(RemoteStorage::new(
                    endpoint,
                    &self.bucket,
                    token,
                    self.timeout,
                )?))
            }
            _ => {
                tracing::info!("remote storage not configured, results stay on local disk");
                Ok(Arc::new(LocalStorage))
            }
        }
    }
}
