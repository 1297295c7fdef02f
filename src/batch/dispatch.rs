//! The per-slot dispatch loop.
//!
//! One of these runs per worker slot, pulling items from the shared pending
//! queue, feeding the slot's worker, and deciding between the three exits of
//! every item: a terminal result, a worker death (re-enqueue and retry on a
//! fresh worker), or a per-line timeout (synthesized Failed result).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::contracts::{ErrorRecord, FlowRunInfo, LineResult};
use crate::multimedia;
use crate::storage::RunStorage;

use super::backend::{format_current_process, WorkerSlot};
use super::errors::BatchError;
use super::queue::PendingQueue;
use super::types::WorkItem;

/// Poll interval of every queue and channel wait in the loop.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a dispatch loop shares with its siblings and the controller.
pub(crate) struct DispatchContext {
    pub flow_id: String,
    pub queue: Arc<PendingQueue<WorkItem>>,
    pub storage: Arc<dyn RunStorage>,
    pub results: Arc<Mutex<Vec<LineResult>>>,
    pub processing: Arc<DashMap<u64, String>>,
    pub completed: Arc<DashMap<u64, String>>,
    pub line_timeout: Duration,
    pub output_dir: Option<PathBuf>,
    pub total_lines: usize,
}

impl DispatchContext {
    /// Externalize multimedia payloads and move the terminal result into the
    /// shared collection.
    fn collect_result(&self, mut result: LineResult) {
        if let Some(dir) = &self.output_dir {
            multimedia::externalize_line_result(&mut result, dir);
        }
        let mut results = self.results.lock();
        results.push(result);
        info!("Finished {} / {} lines.", results.len(), self.total_lines);
    }

    /// Forward a streamed, non-terminal record to the real sink. Returns the
    /// terminal result when the message is one matching `line`.
    fn sift_message(
        &self,
        message: super::transport::WorkerMessage,
        line: u64,
    ) -> Option<LineResult> {
        use super::transport::WorkerMessage;
        match message {
            WorkerMessage::Line(result) if result.run_info.index == line => Some(*result),
            WorkerMessage::Line(result) => {
                warn!(
                    expected = line,
                    got = result.run_info.index,
                    "dropping terminal result from a stale generation"
                );
                None
            }
            WorkerMessage::FlowRun(record) => {
                self.storage.persist_flow_run(&record);
                None
            }
            WorkerMessage::NodeRun(record) => {
                self.storage.persist_node_run(&record);
                None
            }
            WorkerMessage::Ready { .. } => None,
        }
    }
}

/// Drive one worker slot until the pending queue stays empty.
pub(crate) async fn dispatch_loop(
    ctx: Arc<DispatchContext>,
    mut slot: Box<dyn WorkerSlot>,
) -> Result<(), BatchError> {
    loop {
        let Some(item) = ctx.queue.pop(POLL_INTERVAL).await else {
            // No more work: tear the worker down and finish this slot.
            slot.shutdown().await?;
            return Ok(());
        };

        let line = item.line_index;
        if let Err(err) = slot.send(&item).await {
            // The item never reached the worker; retry it on a fresh one.
            warn!(slot = slot.slot_index(), line, error = %err, "worker rejected item, replacing worker");
            ctx.queue.push(item);
            slot.restart().await?;
            continue;
        }

        let descriptor = format_current_process(&slot.worker_name(), slot.pid(), line, false);
        ctx.processing.insert(line, descriptor);
        let dispatched_wall = Utc::now();
        let dispatched = Instant::now();
        let mut outcome = ItemOutcome::TimedOut;

        while dispatched.elapsed() <= ctx.line_timeout {
            if !slot.is_alive().await {
                outcome = handle_worker_death(&ctx, slot.as_mut(), &item).await?;
                break;
            }
            match slot.recv(POLL_INTERVAL).await? {
                Some(message) => {
                    if let Some(result) = ctx.sift_message(message, line) {
                        ctx.collect_result(result);
                        outcome = ItemOutcome::Completed;
                        break;
                    }
                }
                None => continue,
            }
        }

        match outcome {
            ItemOutcome::Requeued => {
                // The retry owns the line now; its processing entry is
                // refreshed by whichever slot picks the item up next.
                continue;
            }
            ItemOutcome::Completed => {
                let descriptor =
                    format_current_process(&slot.worker_name(), slot.pid(), line, true);
                ctx.completed.insert(line, descriptor);
            }
            ItemOutcome::TimedOut => {
                handle_line_timeout(&ctx, &item, dispatched_wall);
                let descriptor =
                    format_current_process(&slot.worker_name(), slot.pid(), line, true);
                ctx.completed.insert(line, descriptor);
                // A worker that blew its budget cannot be trusted with the
                // next line.
                if !ctx.queue.is_empty() {
                    slot.restart().await?;
                }
            }
        }
        ctx.processing.remove(&line);
    }
}

enum ItemOutcome {
    Completed,
    Requeued,
    TimedOut,
}

/// The worker died while holding an item.
///
/// Its output channel is drained first: when the worker finished the line and
/// died afterwards, the terminal result is already in flight and collecting
/// it avoids executing the line twice. Only when no terminal result surfaces
/// is the item re-enqueued, exactly once, before the slot is restarted.
async fn handle_worker_death(
    ctx: &Arc<DispatchContext>,
    slot: &mut dyn WorkerSlot,
    item: &WorkItem,
) -> Result<ItemOutcome, BatchError> {
    let line = item.line_index;
    warn!(
        slot = slot.slot_index(),
        worker = %slot.worker_name(),
        line,
        "worker died while executing line"
    );

    let mut outcome = ItemOutcome::Requeued;
    while let Some(message) = slot.recv(Duration::from_millis(50)).await? {
        if let Some(result) = ctx.sift_message(message, line) {
            ctx.collect_result(result);
            outcome = ItemOutcome::Completed;
        }
    }

    if matches!(outcome, ItemOutcome::Requeued) {
        ctx.queue.push(item.clone());
    }
    slot.restart().await?;
    Ok(outcome)
}

/// Synthesize the Failed result of a line that exceeded its budget.
fn handle_line_timeout(ctx: &Arc<DispatchContext>, item: &WorkItem, started: chrono::DateTime<Utc>) {
    let timeout_secs = ctx.line_timeout.as_secs();
    let line = item.line_index;
    warn!(line, timeout_secs, "line timed out");

    let timeout_error = BatchError::LineTimeout { line, timeout_secs };
    let record = ErrorRecord::from_error("LineTimeout", &timeout_error);
    let run_info = FlowRunInfo::from_exception(
        &item.run_id,
        &ctx.flow_id,
        line,
        Some(Value::Object(item.inputs.clone())),
        started,
        &record,
    );
    ctx.storage.persist_flow_run(&run_info);
    ctx.collect_result(LineResult::from_failure(run_info));
}
