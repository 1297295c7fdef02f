//! The multi-process batch execution engine.
//!
//! A [`LineExecutionPool`] fans a batch of input lines out across a pool of
//! worker processes, one dispatch loop per worker slot. Dispatch loops pull
//! from a shared [`PendingQueue`], enforce the per-line timeout, replace
//! crashed workers, and collect exactly one [`crate::contracts::LineResult`]
//! per line.
//!
//! Worker creation is pluggable through [`WorkerBackend`]: the prewarm
//! strategy resolves the flow once in a runner process that creates every
//! worker itself; the cold-start strategy spawns each worker fresh; the
//! service strategy launches external worker services over local TCP for
//! flows executed by another runtime.

mod backend;
mod dispatch;
mod errors;
mod pool;
mod prewarm;
mod process;
mod proxy;
mod queue;
mod runner;
mod spawn;
mod types;
mod worker;

/// Wire frames and framed channel IO shared by every worker strategy.
pub mod transport;

pub use backend::{WorkerBackend, WorkerSlot, WORKER_STARTUP_TIMEOUT};
pub use errors::BatchError;
pub use pool::LineExecutionPool;
pub use prewarm::{PrewarmBackend, PrewarmSlot};
pub use process::{ProcessHandle, WorkerLauncher};
pub use proxy::{FlowDefinition, ServiceWorkerBackend, ServiceWorkerConfig, ServiceWorkerSlot};
pub use queue::PendingQueue;
pub use spawn::{ColdStartBackend, HealthyWorker};
pub use types::{
    BatchPoolConfig, StartMethod, WorkItem, DEFAULT_LINE_TIMEOUT, DEFAULT_LOG_INTERVAL,
    DEFAULT_WORKER_COUNT, LINE_TIMEOUT_ENV, LOG_INTERVAL_ENV, START_METHOD_ENV, WORKER_COUNT_ENV,
};
pub use worker::{maybe_run_worker, WORKER_ROLE_ENV, WORKER_SLOT_ENV};
