//! Worker pool: device discovery and one OS process per worker.
//!
//! Each worker process gets its ordinal and device through the environment, so the
//! same binary can be launched by hand (`rmbg worker --ordinal 1 --device 1`) or by
//! [`WorkerPool`].

use crate::WorkerBinding;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Queue every GPU-bound worker consumes from.
pub const GPU_QUEUE: &str = "gpu";

pub const ENV_ORDINAL: &str = "RMBG_WORKER_ORDINAL";
pub const ENV_DEVICE_INDEX: &str = "RMBG_DEVICE_INDEX";
pub const ENV_CONCURRENCY: &str = "WORKER_CONCURRENCY";
pub const ENV_QUEUE: &str = "RMBG_QUEUE";

const DEVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker {ordinal}: {source}")]
    Spawn {
        ordinal: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot locate worker executable: {0}")]
    Executable(std::io::Error),
}

/// Number of usable accelerator devices.
///
/// `DEVICE=cpu` forces zero. `RMBG_DEVICE_COUNT` overrides discovery. Otherwise
/// `nvidia-smi -L` is consulted; any failure there means no devices.
pub async fn detect_devices() -> usize {
    if std::env::var("DEVICE").is_ok_and(|v| v.eq_ignore_ascii_case("cpu")) {
        tracing::info!("DEVICE=cpu, skipping device discovery");
        return 0;
    }
    if let Some(n) = std::env::var("RMBG_DEVICE_COUNT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        tracing::info!(devices = n, "device count taken from RMBG_DEVICE_COUNT");
        return n;
    }
    let probe = Command::new("nvidia-smi")
        .arg("-L")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(DEVICE_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) if output.status.success() => {
            let n = count_gpu_lines(&String::from_utf8_lossy(&output.stdout));
            tracing::info!(devices = n, "detected GPU devices");
            n
        }
        Ok(Ok(output)) => {
            tracing::warn!(code = ?output.status.code(), "nvidia-smi failed, assuming no GPU");
            0
        }
        Ok(Err(e)) => {
            tracing::info!(error = %e, "nvidia-smi not available, assuming no GPU");
            0
        }
        Err(_) => {
            tracing::warn!("nvidia-smi timed out, assuming no GPU");
            0
        }
    }
}

/// `nvidia-smi -L` prints one `GPU <n>: <name> (UUID: ...)` line per device.
fn count_gpu_lines(listing: &str) -> usize {
    listing
        .lines()
        .filter(|l| l.trim_start().starts_with("GPU "))
        .count()
}

/// A running worker process.
pub struct WorkerHandle {
    pub binding: WorkerBinding,
    child: Child,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Launches and supervises worker processes.
pub struct WorkerPool {
    program: PathBuf,
    args: Vec<String>,
    queue: String,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Pool that re-executes the current binary as `<exe> worker`.
    pub fn current_exe(queue: &str) -> Result<Self, PoolError> {
        let exe = std::env::current_exe().map_err(PoolError::Executable)?;
        Ok(Self::with_command(exe, vec!["worker".to_string()], queue))
    }

    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>, queue: &str) -> Self {
        Self {
            program: program.into(),
            args,
            queue: queue.to_string(),
            handles: Vec::new(),
        }
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// One worker per device, each with `concurrency` slots; a single CPU worker when
    /// `device_count` is zero.
    pub fn spawn_workers(
        &mut self,
        device_count: usize,
        concurrency: usize,
    ) -> Result<&[WorkerHandle], PoolError> {
        let count = device_count.max(1);
        for ordinal in 0..count {
            let binding = WorkerBinding::assign(ordinal, device_count);
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args)
                .env(ENV_ORDINAL, ordinal.to_string())
                .env(ENV_CONCURRENCY, concurrency.max(1).to_string())
                .env(ENV_QUEUE, &self.queue)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            match binding.device().index() {
                Some(index) => {
                    cmd.env(ENV_DEVICE_INDEX, index.to_string())
                        .env("CUDA_VISIBLE_DEVICES", index.to_string());
                }
                None => {
                    cmd.env_remove(ENV_DEVICE_INDEX);
                }
            }
            let child = cmd
                .spawn()
                .map_err(|source| PoolError::Spawn { ordinal, source })?;
            tracing::info!(
                worker = %binding.worker_id(),
                pid = ?child.id(),
                queue = %self.queue,
                concurrency,
                "started worker process"
            );
            self.handles.push(WorkerHandle { binding, child });
        }
        Ok(&self.handles)
    }

    /// Workers that exited since the last call. They are not restarted.
    pub fn reap_exited(&mut self) -> Vec<(WorkerBinding, ExitStatus)> {
        let mut exited = Vec::new();
        self.handles.retain_mut(|h| match h.child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(worker = %h.binding.worker_id(), %status, "worker process exited");
                exited.push((h.binding, status));
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(worker = %h.binding.worker_id(), error = %e, "cannot poll worker");
                true
            }
        });
        exited
    }

    /// SIGTERM every worker, wait up to `grace`, then kill the stragglers.
    pub async fn shutdown(&mut self, grace: Duration) {
        for h in &self.handles {
            if !terminate(&h.child) {
                tracing::debug!(worker = %h.binding.worker_id(), "no pid to signal");
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        for mut h in self.handles.drain(..) {
            let worker = h.binding.worker_id();
            match tokio::time::timeout_at(deadline, h.child.wait()).await {
                Ok(Ok(status)) => tracing::info!(%worker, %status, "worker stopped"),
                Ok(Err(e)) => tracing::warn!(%worker, error = %e, "failed waiting for worker"),
                Err(_) => {
                    tracing::warn!(%worker, "worker did not stop within grace period, killing");
                    if let Err(e) = h.child.kill().await {
                        tracing::error!(%worker, error = %e, "failed to kill worker");
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    match child.id() {
        // SAFETY: kill(2) with a pid we own and a valid signal number.
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmbg_types::Device;

    #[test]
    fn counts_nvidia_smi_listing() {
        let listing = "GPU 0: NVIDIA A10G (UUID: GPU-aaaa)\nGPU 1: NVIDIA A10G (UUID: GPU-bbbb)\n";
        assert_eq!(count_gpu_lines(listing), 2);
        assert_eq!(count_gpu_lines(""), 0);
        assert_eq!(count_gpu_lines("No devices were found\n"), 0);
    }

    #[tokio::test]
    async fn spawns_one_worker_per_device_and_stops_them() {
        let mut pool = WorkerPool::with_command("sleep", vec!["30".to_string()], GPU_QUEUE);
        let handles = pool.spawn_workers(3, 1).unwrap();
        let devices: Vec<Device> = handles.iter().map(|h| h.binding.device()).collect();
        assert_eq!(devices, vec![Device::Gpu(0), Device::Gpu(1), Device::Gpu(2)]);
        assert!(handles.iter().all(|h| h.pid().is_some()));

        let started = std::time::Instant::now();
        pool.shutdown(Duration::from_secs(5)).await;
        assert!(pool.handles().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn no_devices_spawns_a_single_cpu_worker() {
        let mut pool = WorkerPool::with_command("sleep", vec!["30".to_string()], GPU_QUEUE);
        let handles = pool.spawn_workers(0, 2).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].binding.device(), Device::Cpu);
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn exited_workers_are_reaped() {
        let mut pool = WorkerPool::with_command("true", Vec::new(), GPU_QUEUE);
        pool.spawn_workers(1, 1).unwrap();
        let mut exited = Vec::new();
        for _ in 0..50 {
            exited = pool.reap_exited();
            if !exited.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(exited.len(), 1);
        assert!(exited[0].1.success());
        assert!(pool.handles().is_empty());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut pool = WorkerPool::with_command("/nonexistent/rmbg-worker", Vec::new(), GPU_QUEUE);
        let err = pool.spawn_workers(1, 1).err().unwrap();
        assert!(matches!(err, PoolError::Spawn { ordinal: 0, .. }));
    }
}
