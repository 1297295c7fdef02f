//! Shared test fixtures: an echo flow executor and an in-process worker
//! backend that can simulate crashes and slow lines without real OS
//! processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use lineflow::batch::transport::{WorkerInit, WorkerMessage};
use lineflow::batch::{BatchError, WorkItem, WorkerBackend, WorkerSlot};
use lineflow::contracts::{
    ErrorRecord, FlowRunInfo, LineResult, Mapping, NodeRunInfo, Status, LINE_NUMBER_KEY,
};
use lineflow::executor::{
    ExecutorError, FlowExecutor, FlowExecutorFactory, DEFAULT_NODE_CONCURRENCY,
};
use lineflow::storage::{QueueRunStorage, RunStorage};

/// Wall-clock execution window of one line, for concurrency assertions.
pub type ExecutionWindows = Arc<Mutex<Vec<(u64, Instant, Instant)>>>;

/// Flow executor that echoes its inputs.
///
/// Reserved input keys steer its behavior:
/// - `"sleep_ms"`: sleep before producing the result
/// - `"fail"`: return a Failed result, the way a tool error would
/// - `"explode"`: escape the executor with an error
pub struct EchoFlow {
    flow_id: String,
    storage: Arc<dyn RunStorage>,
    windows: Option<ExecutionWindows>,
}

#[async_trait]
impl FlowExecutor for EchoFlow {
    fn flow_id(&self) -> &str {
        &self.flow_id
    }

    async fn exec_line(
        &mut self,
        inputs: &Mapping,
        run_id: &str,
        index: u64,
        _variant_id: Option<&str>,
        _validate_inputs: bool,
        _node_concurrency: usize,
    ) -> Result<LineResult, ExecutorError> {
        let started_wall = Utc::now();
        let started = Instant::now();

        if let Some(ms) = inputs.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if inputs.contains_key("explode") {
            return Err(ExecutorError::Execution("injected executor failure".into()));
        }

        let node_run = NodeRunInfo {
            node: "echo".into(),
            run_id: format!("{run_id}_echo_{index}"),
            flow_run_id: format!("{run_id}_{index}"),
            status: Status::Completed,
            error: None,
            inputs: Some(Value::Object(inputs.clone())),
            output: Some(json!({"echo": Value::Object(inputs.clone())})),
            start_time: started_wall,
            end_time: Some(Utc::now()),
            index,
        };
        self.storage.persist_node_run(&node_run);

        if inputs.contains_key("fail") {
            let record = ErrorRecord::new("ToolError", format!("line {index} failed in a tool"));
            let run_info = FlowRunInfo::from_exception(
                run_id,
                &self.flow_id,
                index,
                Some(Value::Object(inputs.clone())),
                started_wall,
                &record,
            );
            self.storage.persist_flow_run(&run_info);
            return Ok(LineResult::from_failure(run_info));
        }

        let mut output = Mapping::new();
        output.insert("echo".into(), Value::Object(inputs.clone()));
        output.insert(LINE_NUMBER_KEY.into(), json!(index));

        let mut run_info = FlowRunInfo::completed(
            run_id,
            &self.flow_id,
            index,
            Some(Value::Object(output.clone())),
        );
        run_info.inputs = Some(Value::Object(inputs.clone()));
        run_info.start_time = started_wall;
        self.storage.persist_flow_run(&run_info);

        if let Some(windows) = &self.windows {
            windows.lock().push((index, started, Instant::now()));
        }

        let mut node_run_infos = HashMap::new();
        node_run_infos.insert("echo".to_string(), node_run);
        Ok(LineResult {
            output,
            aggregation_inputs: Mapping::new(),
            run_info,
            node_run_infos,
        })
    }
}

/// Factory producing [`EchoFlow`] executors.
#[derive(Default)]
pub struct EchoFactory {
    pub windows: Option<ExecutionWindows>,
}

#[async_trait]
impl FlowExecutorFactory for EchoFactory {
    async fn create(
        &self,
        storage: Arc<dyn RunStorage>,
    ) -> Result<Box<dyn FlowExecutor>, ExecutorError> {
        Ok(Box::new(EchoFlow {
            flow_id: "echo".into(),
            storage,
            windows: self.windows.clone(),
        }))
    }
}

/// Run-info sink that remembers every record it sees.
#[derive(Default)]
pub struct CollectingStorage {
    pub flow_runs: Mutex<Vec<FlowRunInfo>>,
    pub node_runs: Mutex<Vec<NodeRunInfo>>,
}

impl RunStorage for CollectingStorage {
    fn persist_flow_run(&self, run_info: &FlowRunInfo) {
        self.flow_runs.lock().push(run_info.clone());
    }

    fn persist_node_run(&self, run_info: &NodeRunInfo) {
        self.node_runs.lock().push(run_info.clone());
    }
}

/// Per-line crash plan: the worker holding the line dies (without emitting a
/// terminal result) as many times as the configured count.
#[derive(Default)]
pub struct CrashPlan {
    remaining: DashMap<u64, AtomicUsize>,
}

impl CrashPlan {
    pub fn crash_times(&self, line: u64, times: usize) {
        self.remaining.insert(line, AtomicUsize::new(times));
    }

    fn should_crash(&self, line: u64) -> bool {
        let Some(counter) = self.remaining.get(&line) else {
            return false;
        };
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process stand-in for a worker process: a task running a real executor
/// against real queue-backed storage, with injectable death.
pub struct ScriptedSlot {
    slot: usize,
    generation: usize,
    factory: Arc<dyn FlowExecutorFactory>,
    crash_plan: Arc<CrashPlan>,
    alive: Arc<AtomicBool>,
    items: Option<UnboundedSender<WorkItem>>,
    messages: UnboundedReceiver<WorkerMessage>,
    task: Option<JoinHandle<()>>,
}

impl ScriptedSlot {
    async fn start(
        slot: usize,
        generation: usize,
        factory: Arc<dyn FlowExecutorFactory>,
        crash_plan: Arc<CrashPlan>,
    ) -> Result<Self, BatchError> {
        let (item_tx, mut item_rx) = tokio::sync::mpsc::unbounded_channel::<WorkItem>();
        let (msg_tx, msg_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerMessage>();
        let alive = Arc::new(AtomicBool::new(true));

        let storage = Arc::new(QueueRunStorage::new(msg_tx.clone()));
        let mut executor = factory
            .create(storage)
            .await
            .map_err(|err| BatchError::Pool(err.to_string()))?;

        let worker_alive = alive.clone();
        let worker_crashes = crash_plan.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = item_rx.recv().await {
                if worker_crashes.should_crash(item.line_index) {
                    // Simulated process death: no terminal message, ever.
                    worker_alive.store(false, Ordering::SeqCst);
                    return;
                }
                let outcome = executor
                    .exec_line(
                        &item.inputs,
                        &item.run_id,
                        item.line_index,
                        item.variant_id.as_deref(),
                        item.validate_inputs,
                        DEFAULT_NODE_CONCURRENCY,
                    )
                    .await;
                let mut result = match outcome {
                    Ok(result) => result,
                    Err(err) => {
                        let record = ErrorRecord::from_error("ExecutorError", &err);
                        let run_info = FlowRunInfo::from_exception(
                            &item.run_id,
                            "echo",
                            item.line_index,
                            Some(Value::Object(item.inputs.clone())),
                            Utc::now(),
                            &record,
                        );
                        let _ = msg_tx.send(WorkerMessage::FlowRun(run_info.clone()));
                        LineResult::from_failure(run_info)
                    }
                };
                result.scrub_output();
                let _ = msg_tx.send(WorkerMessage::Line(Box::new(result)));
            }
        });

        Ok(Self {
            slot,
            generation,
            factory,
            crash_plan,
            alive,
            items: Some(item_tx),
            messages: msg_rx,
            task: Some(task),
        })
    }

    fn stop(&mut self) {
        self.items = None;
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl WorkerSlot for ScriptedSlot {
    fn slot_index(&self) -> usize {
        self.slot
    }

    fn pid(&self) -> Option<u32> {
        Some(40_000 + (self.slot * 100 + self.generation) as u32)
    }

    fn worker_name(&self) -> String {
        format!("Scripted-{}-gen{}", self.slot, self.generation)
    }

    async fn send(&mut self, item: &WorkItem) -> Result<(), BatchError> {
        let sender = self
            .items
            .as_ref()
            .ok_or_else(|| BatchError::Pool("scripted worker stopped".into()))?;
        sender
            .send(item.clone())
            .map_err(|_| BatchError::Pool("scripted worker channel closed".into()))
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<WorkerMessage>, BatchError> {
        match tokio::time::timeout(timeout, self.messages.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn restart(&mut self) -> Result<(), BatchError> {
        self.stop();
        let replacement = ScriptedSlot::start(
            self.slot,
            self.generation + 1,
            self.factory.clone(),
            self.crash_plan.clone(),
        )
        .await?;
        *self = replacement;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), BatchError> {
        self.stop();
        Ok(())
    }
}

/// Backend producing [`ScriptedSlot`]s.
pub struct ScriptedBackend {
    factory: Arc<dyn FlowExecutorFactory>,
    pub crash_plan: Arc<CrashPlan>,
}

impl ScriptedBackend {
    pub fn new(factory: Arc<dyn FlowExecutorFactory>) -> Self {
        Self {
            factory,
            crash_plan: Arc::new(CrashPlan::default()),
        }
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn shares_preloaded_flow(&self) -> bool {
        true
    }

    async fn start(
        &self,
        slots: usize,
        _init: WorkerInit,
    ) -> Result<Vec<Box<dyn WorkerSlot>>, BatchError> {
        let mut handles: Vec<Box<dyn WorkerSlot>> = Vec::with_capacity(slots);
        for slot in 0..slots {
            handles.push(Box::new(
                ScriptedSlot::start(slot, 0, self.factory.clone(), self.crash_plan.clone()).await?,
            ));
        }
        Ok(handles)
    }
}

/// Build batch input rows: `(index, {"value": index, ..extra})`.
pub fn make_lines(indices: &[u64], extra: &[(&str, Value)]) -> Vec<(u64, Mapping)> {
    indices
        .iter()
        .map(|&index| {
            let mut inputs = Mapping::new();
            inputs.insert("value".into(), json!(index));
            for (key, value) in extra {
                inputs.insert((*key).into(), value.clone());
            }
            (index, inputs)
        })
        .collect()
}
