//! Run-info sinks.
//!
//! A [`RunStorage`] receives flow and node run records as they are produced.
//! The controller owns the real sink; worker processes get a
//! [`QueueRunStorage`] that forwards records into their output channel so the
//! controller side can persist them.

mod queue;

pub use queue::QueueRunStorage;

use crate::contracts::{FlowRunInfo, NodeRunInfo};

/// Receives run records as execution produces them.
///
/// Implementations must tolerate being called from the middle of line
/// execution; records for a line arrive before that line's terminal result.
pub trait RunStorage: Send + Sync {
    /// Persist a line-level flow run record.
    fn persist_flow_run(&self, run_info: &FlowRunInfo);

    /// Persist a node run record.
    fn persist_node_run(&self, run_info: &NodeRunInfo);
}

/// Sink that drops every record, the default when the caller supplies none.
#[derive(Debug, Default)]
pub struct NoopRunStorage;

impl RunStorage for NoopRunStorage {
    fn persist_flow_run(&self, _run_info: &FlowRunInfo) {}

    fn persist_node_run(&self, _run_info: &NodeRunInfo) {}
}
