//! Worker identity and device binding, fixed at process start.

use rmbg_types::Device;

/// A worker's ordinal and the device it may use. Immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBinding {
    ordinal: usize,
    device: Device,
}

impl WorkerBinding {
    /// Round-robin assignment: `Gpu(ordinal mod device_count)`, or CPU when there is no device.
    pub fn assign(ordinal: usize, device_count: usize) -> Self {
        let device = if device_count == 0 {
            Device::Cpu
        } else {
            Device::Gpu((ordinal % device_count) as u32)
        };
        Self { ordinal, device }
    }

    /// Binding handed to a worker process by the pool (explicit device index or none).
    pub fn with_device_index(ordinal: usize, device_index: Option<u32>) -> Self {
        Self {
            ordinal,
            device: device_index.map(Device::Gpu).unwrap_or(Device::Cpu),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Identity used for heartbeats and logs.
    pub fn worker_id(&self) -> String {
        format!("worker-{}@{}", self.ordinal, self.device)
    }
}
