use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ErrorRecord;

/// Terminal and in-flight states of a flow or node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Run is currently executing
    Running,
    /// Run finished successfully
    Completed,
    /// Run finished with an error
    Failed,
    /// Run was skipped by the flow's own control logic
    Bypassed,
}

impl Status {
    /// Whether this status marks the end of a run.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Bypassed)
    }
}

/// Telemetry record for one line-level flow run.
///
/// Created by the single-line executor while the line runs and emitted through
/// the run-info sink. The pool also synthesizes one of these when it has to
/// report a failure the executor never saw (timeout, worker crash during
/// startup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunInfo {
    /// Identifier of this line run, `"{run_id}_{line}"`.
    pub run_id: String,
    /// Current status of the run.
    pub status: Status,
    /// Structured error payload when the run failed.
    pub error: Option<Value>,
    /// Line inputs as handed to the executor.
    pub inputs: Option<Value>,
    /// Flow outputs, present once the run completed.
    pub output: Option<Value>,
    /// The batch run this line belongs to.
    pub parent_run_id: String,
    /// Root run of the whole batch, same as `parent_run_id` for batch lines.
    pub root_run_id: String,
    /// Identifier of the executed flow.
    pub flow_id: String,
    /// UTC time the run started.
    pub start_time: DateTime<Utc>,
    /// UTC time the run terminated, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Zero-based index of the line in the batch dataset.
    pub index: u64,
}

impl FlowRunInfo {
    /// Build a Completed record for a line that just finished.
    pub fn completed(run_id: &str, flow_id: &str, index: u64, output: Option<Value>) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("{run_id}_{index}"),
            status: Status::Completed,
            error: None,
            inputs: None,
            output,
            parent_run_id: run_id.to_string(),
            root_run_id: run_id.to_string(),
            flow_id: flow_id.to_string(),
            start_time: now,
            end_time: Some(now),
            index,
        }
    }

    /// Build a Failed record for an error raised outside normal line execution.
    ///
    /// Used by the worker loop when line execution itself blows up, and by the
    /// dispatch loop to synthesize timeout results.
    pub fn from_exception(
        run_id: &str,
        flow_id: &str,
        index: u64,
        inputs: Option<Value>,
        start_time: DateTime<Utc>,
        record: &ErrorRecord,
    ) -> Self {
        Self {
            run_id: format!("{run_id}_{index}"),
            status: Status::Failed,
            error: Some(record.to_value()),
            inputs,
            output: None,
            parent_run_id: run_id.to_string(),
            root_run_id: run_id.to_string(),
            flow_id: flow_id.to_string(),
            start_time,
            end_time: Some(Utc::now()),
            index,
        }
    }
}

/// Telemetry record for one node run inside a line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunInfo {
    /// Name of the node in the flow definition.
    pub node: String,
    /// Identifier of this node run, `"{run_id}_{node}_{line}"`.
    pub run_id: String,
    /// The line run this node run belongs to.
    pub flow_run_id: String,
    /// Current status of the node run.
    pub status: Status,
    /// Structured error payload when the node failed.
    pub error: Option<Value>,
    /// Node inputs after input mapping.
    pub inputs: Option<Value>,
    /// Node output value.
    pub output: Option<Value>,
    /// UTC time the node run started.
    pub start_time: DateTime<Utc>,
    /// UTC time the node run terminated, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Zero-based index of the line in the batch dataset.
    pub index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_statuses() {
        assert!(Status::Completed.is_terminated());
        assert!(Status::Failed.is_terminated());
        assert!(Status::Bypassed.is_terminated());
        assert!(!Status::Running.is_terminated());
    }

    #[test]
    fn exception_record_carries_line_identity() {
        let record = ErrorRecord::new("TestError", "boom");
        let info = FlowRunInfo::from_exception("run-1", "flow-1", 7, None, Utc::now(), &record);
        assert_eq!(info.run_id, "run-1_7");
        assert_eq!(info.parent_run_id, "run-1");
        assert_eq!(info.index, 7);
        assert_eq!(info.status, Status::Failed);
        assert!(info.error.is_some());
        assert!(info.end_time.is_some());
    }

    #[test]
    fn flow_run_info_round_trips_through_serde() {
        let record = ErrorRecord::new("TestError", "boom");
        let info = FlowRunInfo::from_exception("run-1", "flow-1", 0, None, Utc::now(), &record);
        let json = serde_json::to_string(&info).unwrap();
        let back: FlowRunInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, info.run_id);
        assert_eq!(back.status, info.status);
    }
}
