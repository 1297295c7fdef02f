//! Wire protocol between the controller, the prewarm runner and the workers.
//!
//! Every channel is a stream of newline-delimited JSON frames. Worker stdio
//! carries [`WorkerRequest`]/[`WorkerMessage`]; the runner's stdio multiplexes
//! per-slot traffic and the shared control-signal channel as
//! [`RunnerRequest`]/[`RunnerEvent`] frames tagged with the slot index.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::context::OperationContext;
use crate::contracts::{FlowRunInfo, LineResult, NodeRunInfo};
use crate::executor::FlowSnapshot;

use super::types::WorkItem;

/// Channel and wire-format failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying pipe or socket failed.
    #[error("worker channel error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("malformed worker frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// A worker process could not be spawned.
    #[error("failed to spawn worker process: {0}")]
    Spawn(String),

    /// The worker closed its channel before the expected handshake.
    #[error("worker exited during startup: {0}")]
    Handshake(String),
}

/// Everything a worker needs before its first line: the diagnostic
/// environment of the parent and, for prewarmed workers, the resolved flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Operation-context snapshot to restore inside the worker.
    pub operation_context: OperationContext,
    /// Log filter directive the worker initializes its subscriber with.
    pub log_filter: Option<String>,
    /// Pre-resolved flow, present under the prewarm strategy.
    pub flow_snapshot: Option<FlowSnapshot>,
}

impl WorkerInit {
    /// Capture the controller's current diagnostic environment.
    pub fn capture() -> Self {
        Self {
            operation_context: OperationContext::current(),
            log_filter: std::env::var("RUST_LOG").ok(),
            flow_snapshot: None,
        }
    }
}

/// Controller/runner to worker frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// First frame on every worker channel.
    Init(WorkerInit),
    /// Execute one line.
    Line(WorkItem),
}

/// Worker to controller frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Handshake: the worker is initialized and idle.
    Ready {
        /// OS process id of the worker.
        pid: u32,
        /// Generation name of the worker, changes on every replacement.
        name: String,
    },
    /// Streamed line-level run record.
    FlowRun(FlowRunInfo),
    /// Streamed node-level run record.
    NodeRun(NodeRunInfo),
    /// Terminal result for the in-flight line.
    Line(Box<LineResult>),
}

/// Control-signal verbs for one slot of the prewarm runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Kill the slot's worker and leave the slot empty.
    Delete,
    /// Kill the slot's worker and start a replacement.
    Restart,
}

/// Controller to runner frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerRequest {
    /// First frame: shared worker init plus the slot count.
    Init {
        /// Init shipped on to every worker the runner creates.
        init: WorkerInit,
        /// Number of slots to bring up.
        slots: usize,
    },
    /// Forward one line to a slot's worker.
    Line {
        /// Target slot.
        slot: usize,
        /// The line to execute.
        item: WorkItem,
    },
    /// Shared control-signal channel: delete or restart one slot.
    Control {
        /// Target slot.
        slot: usize,
        /// Requested action.
        signal: ControlSignal,
    },
}

/// Runner to controller frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// A slot's worker came up (initially or after a restart).
    Spawned {
        /// Slot the worker fills.
        slot: usize,
        /// OS process id of the worker.
        pid: u32,
        /// Generation name of the worker.
        name: String,
    },
    /// A slot's worker exited.
    Exited {
        /// Slot that lost its worker.
        slot: usize,
        /// OS process id of the worker that exited, so stale exit events from
        /// a replaced generation can be told apart from the current one.
        pid: u32,
        /// Exit code when the runner observed one.
        code: Option<i32>,
    },
    /// A message from a slot's worker.
    Message {
        /// Originating slot.
        slot: usize,
        /// The forwarded worker message.
        message: WorkerMessage,
    },
}

/// Reads newline-delimited JSON frames.
///
/// `read_frame` resolves to `Ok(None)` on a clean end of stream; callers poll
/// with their own `tokio::time::timeout` (the read is cancellation safe, a
/// partial line stays buffered).
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a raw byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Read the next frame, `None` on end of stream.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
            }
        }
    }
}

/// Writes newline-delimited JSON frames, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a raw byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and send one frame.
    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
