//! ExecutionContext: one processor per worker process, one device call at a time.

use rmbg_types::Device;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to write output: {0}")]
    Encode(String),
    #[error("processor initialization failed: {0}")]
    Init(String),
    #[error("execution task aborted: {0}")]
    Aborted(String),
}

/// Processor settings (`IMG_SIZE`, `MATTE_THRESHOLD`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Square working resolution the mask is computed at.
    pub img_size: u32,
    /// Foreground score above which a pixel stays opaque, in [0, 1].
    pub threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            img_size: 320,
            threshold: 0.5,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let img_size = std::env::var("IMG_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.img_size);
        let threshold = std::env::var("MATTE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(defaults.threshold);
        Self {
            img_size,
            threshold,
        }
    }
}

/// The opaque inference step: read `input`, write the processed image to `output`.
///
/// Runs on the blocking pool; implementations may hold device state across calls.
pub trait ImageProcessor: Send {
    fn process(&mut self, input: &Path, output: &Path) -> Result<(), EngineError>;
}

/// Device-bound execution context, constructed once per worker process and shared by
/// reference with every dispatch slot.
pub struct ExecutionContext {
    device: Device,
    processor: Arc<Mutex<Box<dyn ImageProcessor>>>,
}

impl ExecutionContext {
    pub fn new(device: Device, processor: Box<dyn ImageProcessor>) -> Self {
        tracing::info!(%device, "execution context ready");
        Self {
            device,
            processor: Arc::new(Mutex::new(processor)),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Run the processor on `input`, writing `output`. Calls from concurrent slots queue
    /// on the internal mutex. Returns the time spent inside the processor.
    pub async fn run(&self, input: &Path, output: &Path) -> Result<Duration, EngineError> {
        let processor = Arc::clone(&self.processor);
        let input: PathBuf = input.to_path_buf();
        let output: PathBuf = output.to_path_buf();
        let device = self.device;
        tokio::task::spawn_blocking(move || -> Result<Duration, EngineError> {
            let mut guard = processor.lock().unwrap_or_else(|poisoned| {
                tracing::warn!(%device, "processor mutex poisoned by an earlier panic, reusing");
                poisoned.into_inner()
            });
            tracing::info!(%device, input = %input.display(), "running inference");
            let start = Instant::now();
            guard.process(&input, &output)?;
            Ok(start.elapsed())
        })
        .await
        .map_err(|e| EngineError::Aborted(e.to_string()))?
    }
}
