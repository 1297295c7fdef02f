//! The seam between the batch engine and the flow-execution engine.
//!
//! The pool never executes flow nodes itself. It drives implementations of
//! [`FlowExecutor`], one per worker process, obtained through a
//! [`FlowExecutorFactory`] the host application supplies. The factory is the
//! only place the expensive flow definition load happens, and the
//! [`FlowSnapshot`] it can capture is what lets prewarmed workers skip that
//! load entirely.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::{LineResult, Mapping};
use crate::storage::RunStorage;

/// Node concurrency handed to `exec_line` during batch runs.
pub const DEFAULT_NODE_CONCURRENCY: usize = 2;

/// Errors escaping flow construction or line execution.
///
/// An `Err` from `exec_line` means the execution machinery itself broke, not
/// that a tool in the flow failed; tool failures come back as `Ok` results
/// with a Failed status already recorded inside.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The flow definition could not be loaded or resolved.
    #[error("flow initialization failed: {0}")]
    Initialization(String),

    /// Line execution escaped the executor's own error handling.
    #[error("line execution failed: {0}")]
    Execution(String),

    /// A flow snapshot could not be captured or hydrated.
    #[error("flow snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// A pre-resolved flow definition, cheap to ship to and hydrate in a worker.
///
/// Captured once by the prewarm runner so its workers skip the flow reload.
/// The payload shape is owned by the factory that produced it; the engine
/// only moves it around.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSnapshot(pub serde_json::Value);

/// Executes single lines of a batch against a loaded flow.
///
/// One executor lives inside each worker process, bound to the run-info sink
/// it should stream node and flow records into.
#[async_trait]
pub trait FlowExecutor: Send {
    /// Identifier of the loaded flow, used in synthesized run records.
    fn flow_id(&self) -> &str;

    /// Execute one line to completion or failure.
    async fn exec_line(
        &mut self,
        inputs: &Mapping,
        run_id: &str,
        index: u64,
        variant_id: Option<&str>,
        validate_inputs: bool,
        node_concurrency: usize,
    ) -> Result<LineResult, ExecutorError>;
}

/// Builds [`FlowExecutor`] instances inside worker processes.
///
/// `create` is the cold path: load the flow definition, resolve tools and
/// connections, and bind the executor to `storage`. `snapshot` and
/// `create_from_snapshot` are the warm path used by the prewarm strategy;
/// factories that have no cheap hydration can rely on the defaults, which
/// fall back to the cold path.
#[async_trait]
pub trait FlowExecutorFactory: Send + Sync {
    /// Fully load the flow and build an executor bound to `storage`.
    async fn create(
        &self,
        storage: Arc<dyn RunStorage>,
    ) -> Result<Box<dyn FlowExecutor>, ExecutorError>;

    /// Capture the loaded flow as a serializable snapshot.
    async fn snapshot(&self) -> Result<FlowSnapshot, ExecutorError> {
        Ok(FlowSnapshot::default())
    }

    /// Hydrate an executor from a previously captured snapshot.
    async fn create_from_snapshot(
        &self,
        _snapshot: &FlowSnapshot,
        storage: Arc<dyn RunStorage>,
    ) -> Result<Box<dyn FlowExecutor>, ExecutorError> {
        self.create(storage).await
    }
}
