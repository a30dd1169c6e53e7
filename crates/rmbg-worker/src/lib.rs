//! Worker side of rmbg: device binding, the worker process pool, the job dispatcher and
//! result storage.

mod binding;
mod dispatcher;
mod pool;
mod storage;

pub use binding::WorkerBinding;
pub use dispatcher::{output_filename, Dispatcher, DispatcherConfig};
pub use pool::{
    detect_devices, PoolError, WorkerHandle, WorkerPool, ENV_CONCURRENCY, ENV_DEVICE_INDEX,
    ENV_ORDINAL, ENV_QUEUE, GPU_QUEUE,
};
pub use storage::{LocalStorage, RemoteStorage, ResultStorage, StorageConfig, StorageError};
