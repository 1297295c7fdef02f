//! Worker-process entry points.
//!
//! Pool workers are new OS processes running the host's own executable, so
//! the host must route into the engine before doing anything else:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(factory: Arc<dyn lineflow::executor::FlowExecutorFactory>) -> lineflow::Result<()> {
//! if lineflow::batch::maybe_run_worker(factory.clone()).await? {
//!     return Ok(()); // this process was a pool worker and has finished
//! }
//! // ... normal host startup ...
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::contracts::{ErrorRecord, FlowRunInfo, LineResult};
use crate::executor::{FlowExecutor, FlowExecutorFactory, DEFAULT_NODE_CONCURRENCY};
use crate::storage::QueueRunStorage;

use super::errors::BatchError;
use super::runner;
use super::transport::{FrameReader, FrameWriter, TransportError, WorkerMessage, WorkerRequest};
use super::types::WorkItem;

/// Environment variable carrying the worker role of a spawned process.
pub const WORKER_ROLE_ENV: &str = "LINEFLOW_WORKER_ROLE";
/// Environment variable carrying the slot index of a line worker.
pub const WORKER_SLOT_ENV: &str = "LINEFLOW_WORKER_SLOT";

pub(crate) const ROLE_LINE: &str = "line";
pub(crate) const ROLE_RUNNER: &str = "runner";

/// Run the worker loop when this process was spawned as a pool worker.
///
/// Returns `Ok(true)` when the process served as a worker and should exit,
/// `Ok(false)` when it is a regular host process. Must be called before the
/// host touches stdin or stdout, which carry the worker wire protocol.
pub async fn maybe_run_worker(factory: Arc<dyn FlowExecutorFactory>) -> crate::Result<bool> {
    match std::env::var(WORKER_ROLE_ENV) {
        Err(_) => Ok(false),
        Ok(role) if role == ROLE_LINE => {
            line_worker_main(factory).await?;
            Ok(true)
        }
        Ok(role) if role == ROLE_RUNNER => {
            runner::runner_main(factory).await?;
            Ok(true)
        }
        Ok(role) => {
            warn!(role = %role, "unknown {WORKER_ROLE_ENV} value, continuing as host process");
            Ok(false)
        }
    }
}

/// Initialize diagnostics from the init frame shipped by the parent.
pub(crate) fn apply_init_diagnostics(init: &super::transport::WorkerInit) {
    init.operation_context.clone().make_current();
    if let Some(filter) = &init.log_filter {
        // Logs go to stderr; stdout is the wire protocol.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// The loop inside one line-worker process.
///
/// Reads work items from stdin, executes them against the factory's executor
/// bound to a queue-backed sink, and emits exactly one terminal result per
/// item on stdout. Runs until the parent closes the channel or the process is
/// interrupted.
async fn line_worker_main(factory: Arc<dyn FlowExecutorFactory>) -> Result<(), BatchError> {
    let mut reader = FrameReader::new(tokio::io::stdin());
    let mut writer = FrameWriter::new(tokio::io::stdout());

    let init = match reader.read_frame::<WorkerRequest>().await? {
        Some(WorkerRequest::Init(init)) => init,
        other => {
            return Err(TransportError::Handshake(format!(
                "expected init frame, got {other:?}"
            ))
            .into())
        }
    };
    apply_init_diagnostics(&init);

    let slot = std::env::var(WORKER_SLOT_ENV).unwrap_or_else(|_| "0".into());
    let generation = Uuid::new_v4().simple().to_string();
    let name = format!("Worker-{slot}-{}", &generation[..8]);

    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();
    let storage = Arc::new(QueueRunStorage::new(out_tx.clone()));
    let mut executor = match &init.flow_snapshot {
        Some(snapshot) => factory.create_from_snapshot(snapshot, storage).await,
        None => factory.create(storage).await,
    }
    .map_err(|err| TransportError::Handshake(format!("executor construction failed: {err}")))?;

    writer
        .write_frame(&WorkerMessage::Ready {
            pid: std::process::id(),
            name: name.clone(),
        })
        .await?;

    // Single writer task: run records stream out the moment the sink sees
    // them, and channel order guarantees each record precedes its line's
    // terminal result.
    let forwarder = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if writer.write_frame(&message).await.is_err() {
                break;
            }
        }
    });

    info!(worker = %name, "worker loop started");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(worker = %name, "worker interrupted, exiting");
                break;
            }
            frame = reader.read_frame::<WorkerRequest>() => match frame {
                Ok(Some(WorkerRequest::Line(item))) => {
                    run_one_line(executor.as_mut(), &item, &out_tx).await;
                }
                Ok(Some(WorkerRequest::Init(_))) => {
                    warn!(worker = %name, "duplicate init frame ignored");
                }
                Ok(None) => break,
                Err(err) => {
                    error!(worker = %name, error = %err, "worker channel failed");
                    break;
                }
            }
        }
    }

    drop(out_tx);
    drop(executor);
    let _ = forwarder.await;
    Ok(())
}

/// Execute one line, guaranteeing exactly one terminal message even when the
/// execution machinery itself fails.
pub(crate) async fn run_one_line(
    executor: &mut dyn FlowExecutor,
    item: &WorkItem,
    out: &UnboundedSender<WorkerMessage>,
) {
    let started = Utc::now();
    let mut result = match executor
        .exec_line(
            &item.inputs,
            &item.run_id,
            item.line_index,
            item.variant_id.as_deref(),
            item.validate_inputs,
            DEFAULT_NODE_CONCURRENCY,
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!(
                line = item.line_index,
                pid = std::process::id(),
                error = %err,
                "line execution escaped the executor"
            );
            let record = ErrorRecord::from_error("ExecutorError", &err);
            let run_info = FlowRunInfo::from_exception(
                &item.run_id,
                executor.flow_id(),
                item.line_index,
                Some(Value::Object(item.inputs.clone())),
                started,
                &record,
            );
            let _ = out.send(WorkerMessage::FlowRun(run_info.clone()));
            LineResult::from_failure(run_info)
        }
    };

    result.scrub_output();
    let _ = out.send(WorkerMessage::Line(Box::new(result)));
}
