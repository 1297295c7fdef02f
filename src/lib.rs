//! # lineflow
//!
//! A batch execution engine for LLM flows: take a flow, a dataset of input
//! lines, and a pool of worker processes, and get back exactly one result per
//! line, surviving worker crashes, per-line timeouts, and flows that fail
//! halfway through.
//!
//! ## Overview
//!
//! The engine runs flows through a narrow seam: the host supplies a
//! [`executor::FlowExecutorFactory`] that can build a single-line executor
//! inside any process, and the pool takes care of everything around it:
//! worker lifecycle, inter-process channels, timeout enforcement, crash
//! recovery, run-record streaming, and multimedia externalization.
//!
//! Because workers are new OS processes running the host's own executable,
//! the host must route into the engine at the very top of `main`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use lineflow::batch::{maybe_run_worker, LineExecutionPool};
//! use lineflow::contracts::{FlowRunInfo, LineResult, Mapping};
//! use lineflow::executor::{ExecutorError, FlowExecutor, FlowExecutorFactory};
//! use lineflow::storage::RunStorage;
//!
//! struct EchoFlow;
//!
//! #[async_trait]
//! impl FlowExecutor for EchoFlow {
//!     fn flow_id(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn exec_line(
//!         &mut self,
//!         inputs: &Mapping,
//!         run_id: &str,
//!         index: u64,
//!         _variant_id: Option<&str>,
//!         _validate_inputs: bool,
//!         _node_concurrency: usize,
//!     ) -> Result<LineResult, ExecutorError> {
//!         let run_info = FlowRunInfo::completed(run_id, "echo", index, None);
//!         let mut output = Mapping::new();
//!         output.insert("echo".into(), serde_json::Value::Object(inputs.clone()));
//!         Ok(LineResult {
//!             output,
//!             aggregation_inputs: Mapping::new(),
//!             run_info,
//!             node_run_infos: Default::default(),
//!         })
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! #[async_trait]
//! impl FlowExecutorFactory for EchoFactory {
//!     async fn create(
//!         &self,
//!         _storage: Arc<dyn RunStorage>,
//!     ) -> Result<Box<dyn FlowExecutor>, ExecutorError> {
//!         Ok(Box::new(EchoFlow))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> lineflow::Result<()> {
//!     let factory = Arc::new(EchoFactory);
//!     // Worker processes re-enter here and never reach the code below.
//!     if maybe_run_worker(factory.clone()).await? {
//!         return Ok(());
//!     }
//!
//!     let pool = LineExecutionPool::new("echo", "run-1");
//!     let mut lines = Vec::new();
//!     for index in 0u64..4 {
//!         let mut inputs = Mapping::new();
//!         inputs.insert("question".into(), serde_json::json!(index));
//!         lines.push((index, inputs));
//!     }
//!
//!     let results = pool.run(lines).await?;
//!     assert_eq!(results.len(), 4);
//!     Ok(())
//! }
//! ```
//!
//! ## Key Features
//!
//! - **Multi-process workers**: true OS-level parallelism, one worker process
//!   per slot, daemon-equivalent lifetime tied to the controller
//! - **Crash recovery**: a dead worker is replaced and its in-flight line is
//!   re-enqueued exactly once; sibling slots never notice
//! - **Per-line timeouts**: a stuck line yields a Failed result tagged with
//!   its index and budget, and the stuck worker is retired
//! - **Two creation strategies**: prewarmed workers sharing one flow
//!   resolution, or cold-started workers loading the flow themselves
//! - **Pluggable runtimes**: external worker services over local TCP slot in
//!   next to native workers
//!
//! ## Modules
//!
//! - [`batch`]: the pool, dispatch loops, worker strategies and wire protocol
//! - [`contracts`]: run records, line results, error presentation
//! - [`executor`]: the flow-execution seam the host implements
//! - [`storage`]: run-info sinks
//! - [`context`]: operation context shipped to workers
//! - [`multimedia`]: externalization of in-memory payloads

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, LineflowError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum LineflowError {
    /// Batch pool error
    #[error("Batch error: {0}")]
    Batch(#[from] batch::BatchError),

    /// Flow construction or execution error
    #[error("Executor error: {0}")]
    Executor(#[from] executor::ExecutorError),

    /// Worker channel or wire-format error
    #[error("Transport error: {0}")]
    Transport(#[from] batch::transport::TransportError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or pipe error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Batch pool, dispatch loops and worker strategies
pub mod batch;

/// Operation context shipped to workers
pub mod context;

/// Data contracts crossing process boundaries
pub mod contracts;

/// The flow-execution seam
pub mod executor;

/// Multimedia externalization
pub mod multimedia;

/// Run-info sinks
pub mod storage;

/// Utility functions and helpers
pub mod utils;
