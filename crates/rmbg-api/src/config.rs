//! Deployment settings, read from the environment after `.env` is loaded.

use rmbg_callback::CallbackConfig;
use rmbg_engine::EngineConfig;
use rmbg_queue::QueueConfig;
use rmbg_worker::{DispatcherConfig, StorageConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// SQLite file shared by the job store and the queue.
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub callbacks: CallbackConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    /// Time workers get to finish after SIGTERM before they are killed.
    pub shutdown_grace: Duration,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match var("API_PORT") {
            Some(v) => v.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "API_PORT",
                value: v,
            })?,
            None => 8000,
        };
        let shutdown_grace = match var("WORKER_SHUTDOWN_GRACE_SECS") {
            Some(v) => Duration::from_secs(v.parse::<u64>().map_err(|_| ConfigError::Invalid {
                key: "WORKER_SHUTDOWN_GRACE_SECS",
                value: v,
            })?),
            None => Duration::from_secs(5),
        };
        Ok(Self {
            host: var("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            db_path: var("RMBG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/rmbg/rmbg.db")),
            upload_dir: var("TEMP_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/rmbg-uploads")),
            queue: QueueConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            callbacks: CallbackConfig::from_env(),
            storage: StorageConfig::from_env(),
            engine: EngineConfig::from_env(),
            shutdown_grace,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A worker counts as live while its last heartbeat is younger than this.
    pub fn worker_liveness(&self) -> Duration {
        self.dispatcher.heartbeat_interval * 3
    }

    /// Create the upload, result and database directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.dispatcher.result_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
