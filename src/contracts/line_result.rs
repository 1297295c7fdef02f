use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::run_info::{FlowRunInfo, NodeRunInfo, Status};
use super::Mapping;

/// Reserved output key some executors echo the line number under.
///
/// The worker loop strips it from line outputs before emitting the terminal
/// result so callers never see it.
pub const LINE_NUMBER_KEY: &str = "line_number";

/// The terminal outcome of executing one line of a batch.
///
/// Exactly one of these is produced per submitted line, whether the line
/// succeeded, failed inside the flow, crashed its worker, or timed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineResult {
    /// Flow outputs for the line; empty when the line failed.
    pub output: Mapping,
    /// Values the flow exposes to a later aggregation step.
    pub aggregation_inputs: Mapping,
    /// The line-level run record.
    pub run_info: FlowRunInfo,
    /// Run records of the individual nodes, keyed by node name.
    pub node_run_infos: HashMap<String, NodeRunInfo>,
}

impl LineResult {
    /// Wrap a Failed flow-run record produced outside normal execution.
    pub fn from_failure(run_info: FlowRunInfo) -> Self {
        Self {
            output: Mapping::new(),
            aggregation_inputs: Mapping::new(),
            run_info,
            node_run_infos: HashMap::new(),
        }
    }

    /// Normalize the result before it leaves the worker: drop the reserved
    /// line-number key and clear outputs of failed lines.
    pub fn scrub_output(&mut self) {
        self.output.remove(LINE_NUMBER_KEY);
        if self.run_info.status == Status::Failed {
            self.output.clear();
        }
    }
}
