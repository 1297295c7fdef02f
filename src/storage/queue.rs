use tokio::sync::mpsc::UnboundedSender;

use crate::batch::transport::WorkerMessage;
use crate::contracts::{FlowRunInfo, NodeRunInfo};

use super::RunStorage;

/// Run-info sink that stages records into a worker's output channel.
///
/// Worker processes cannot reach the controller's real sink, so they write
/// records here instead; the dispatch loop on the other side of the channel
/// forwards each one to the real sink as it arrives.
#[derive(Debug, Clone)]
pub struct QueueRunStorage {
    sender: UnboundedSender<WorkerMessage>,
}

impl QueueRunStorage {
    /// Bind the sink to a worker output channel.
    pub fn new(sender: UnboundedSender<WorkerMessage>) -> Self {
        Self { sender }
    }
}

impl RunStorage for QueueRunStorage {
    fn persist_flow_run(&self, run_info: &FlowRunInfo) {
        // A closed channel means the worker is shutting down; records are
        // dropped rather than panicking mid-teardown.
        let _ = self.sender.send(WorkerMessage::FlowRun(run_info.clone()));
    }

    fn persist_node_run(&self, run_info: &NodeRunInfo) {
        let _ = self.sender.send(WorkerMessage::NodeRun(run_info.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ErrorRecord, FlowRunInfo};
    use chrono::Utc;

    #[tokio::test]
    async fn records_are_forwarded_to_the_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let storage = QueueRunStorage::new(tx);

        let record = ErrorRecord::new("TestError", "boom");
        let info = FlowRunInfo::from_exception("run", "flow", 3, None, Utc::now(), &record);
        storage.persist_flow_run(&info);

        match rx.recv().await {
            Some(WorkerMessage::FlowRun(received)) => assert_eq!(received.run_id, "run_3"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_channel_does_not_panic() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let storage = QueueRunStorage::new(tx);

        let record = ErrorRecord::new("TestError", "boom");
        let info = FlowRunInfo::from_exception("run", "flow", 0, None, Utc::now(), &record);
        storage.persist_flow_run(&info);
    }
}
