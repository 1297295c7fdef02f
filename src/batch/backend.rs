use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::errors::BatchError;
use super::transport::{WorkerInit, WorkerMessage};
use super::types::WorkItem;

/// How long a worker gets to come up and send its Ready handshake.
pub const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// A worker creation strategy.
///
/// Selected once when the pool starts; the dispatch loops never branch on
/// which strategy backs their slots.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Whether workers share the already-resolved flow with their creator.
    ///
    /// When they do not, every worker re-initializes the flow and roughly
    /// duplicates the controller's memory footprint, which feeds the
    /// memory-based worker-count ceiling.
    fn shares_preloaded_flow(&self) -> bool;

    /// Bring up `slots` workers and return one handle per slot.
    async fn start(
        &self,
        slots: usize,
        init: WorkerInit,
    ) -> Result<Vec<Box<dyn WorkerSlot>>, BatchError>;

    /// Tear down backend-level machinery after every slot has shut down.
    async fn shutdown(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// The dispatch loop's view of one worker slot.
///
/// A slot is a stable position in the pool; the worker process behind it is
/// replaced on crash or timeout, never repaired. At most one work item is in
/// flight per slot at any time.
#[async_trait]
pub trait WorkerSlot: Send {
    /// Stable index of this slot within the pool.
    fn slot_index(&self) -> usize;

    /// OS process id of the current worker, if known.
    fn pid(&self) -> Option<u32>;

    /// Generation name of the current worker; changes on every replacement.
    fn worker_name(&self) -> String;

    /// Hand one item to the worker.
    async fn send(&mut self, item: &WorkItem) -> Result<(), BatchError>;

    /// Poll the worker's output channel, `Ok(None)` when `timeout` expires
    /// or the channel is currently drained.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<WorkerMessage>, BatchError>;

    /// Whether the worker process behind this slot is currently alive.
    async fn is_alive(&mut self) -> bool;

    /// Replace the worker with a fresh one in the same slot.
    async fn restart(&mut self) -> Result<(), BatchError>;

    /// Kill the worker and wait until the OS process is gone.
    async fn shutdown(&mut self) -> Result<(), BatchError>;
}

/// Human-readable descriptor of a worker/line pairing, used in the progress
/// maps and the periodic status log.
pub fn format_current_process(
    name: &str,
    pid: Option<u32>,
    line: u64,
    completed: bool,
) -> String {
    let pid_text = pid.map_or_else(|| "unknown".to_string(), |p| p.to_string());
    if completed {
        info!("Process name: {name}, Process id: {pid_text}, Line number: {line} completed.");
    } else {
        info!("Process name: {name}, Process id: {pid_text}, Line number: {line} start execution.");
    }
    format!("Process name({name})-Process id({pid_text})-Line number({line})")
}
