//! Cold-start worker strategy.
//!
//! Each slot is backed by a [`HealthyWorker`]: a wrapper that spawns a fresh
//! worker process with fresh stdio channels, detects its death, and is thrown
//! away wholesale when the worker is replaced. Workers re-initialize the flow
//! from its definition on every start, which is why this strategy feeds the
//! memory-based worker-count ceiling.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::backend::{WorkerBackend, WorkerSlot, WORKER_STARTUP_TIMEOUT};
use super::errors::BatchError;
use super::process::{ProcessHandle, WorkerLauncher};
use super::transport::{FrameReader, FrameWriter, TransportError, WorkerInit, WorkerMessage, WorkerRequest};
use super::types::WorkItem;
use super::worker::{ROLE_LINE, WORKER_ROLE_ENV, WORKER_SLOT_ENV};

/// Creates one fresh worker process per slot, lazily replaced on demand.
pub struct ColdStartBackend {
    launcher: WorkerLauncher,
}

impl ColdStartBackend {
    /// Back workers with the given launcher.
    pub fn new(launcher: WorkerLauncher) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl WorkerBackend for ColdStartBackend {
    fn name(&self) -> &'static str {
        "cold-start"
    }

    fn shares_preloaded_flow(&self) -> bool {
        false
    }

    async fn start(
        &self,
        slots: usize,
        init: WorkerInit,
    ) -> Result<Vec<Box<dyn WorkerSlot>>, BatchError> {
        // Worker startup re-loads the flow, so bring the slots up concurrently.
        let mut starting = JoinSet::new();
        for slot in 0..slots {
            let launcher = self.launcher.clone();
            let init = init.clone();
            starting.spawn(async move {
                let mut worker = HealthyWorker::new(slot, launcher, init);
                worker.start_new().await.map(|()| worker)
            });
        }

        let mut started: Vec<Option<HealthyWorker>> = (0..slots).map(|_| None).collect();
        while let Some(joined) = starting.join_next().await {
            let worker = joined.map_err(|err| BatchError::Pool(err.to_string()))??;
            let slot = worker.slot;
            started[slot] = Some(worker);
        }

        Ok(started
            .into_iter()
            .map(|worker| Box::new(worker.expect("every slot joined")) as Box<dyn WorkerSlot>)
            .collect())
    }
}

/// Supervises a single cold-start worker process.
///
/// `start_new` and `end` bracket one worker generation; a generation is never
/// reused after `end`, replacement always spawns a new process with new
/// channels.
pub struct HealthyWorker {
    slot: usize,
    launcher: WorkerLauncher,
    init: WorkerInit,
    process: Option<ProcessHandle>,
    writer: Option<FrameWriter<ChildStdin>>,
    reader: Option<FrameReader<ChildStdout>>,
    name: String,
}

impl HealthyWorker {
    /// A wrapper with no live worker yet.
    pub fn new(slot: usize, launcher: WorkerLauncher, init: WorkerInit) -> Self {
        Self {
            slot,
            launcher,
            init,
            process: None,
            writer: None,
            reader: None,
            name: format!("Worker-{slot}-unstarted"),
        }
    }

    /// Spawn a fresh worker process and complete its handshake.
    pub async fn start_new(&mut self) -> Result<(), BatchError> {
        let spawned = self.launcher.spawn(&[
            (WORKER_ROLE_ENV, ROLE_LINE.to_string()),
            (WORKER_SLOT_ENV, self.slot.to_string()),
        ])?;

        let mut writer = FrameWriter::new(spawned.stdin);
        let mut reader = FrameReader::new(spawned.stdout);
        writer
            .write_frame(&WorkerRequest::Init(self.init.clone()))
            .await?;

        let ready = tokio::time::timeout(WORKER_STARTUP_TIMEOUT, reader.read_frame()).await;
        match ready {
            Ok(Ok(Some(WorkerMessage::Ready { pid, name }))) => {
                debug!(slot = self.slot, pid, name = %name, "worker ready");
                self.name = name;
                self.process = Some(spawned.handle);
                self.writer = Some(writer);
                self.reader = Some(reader);
                Ok(())
            }
            Ok(Ok(other)) => Err(TransportError::Handshake(format!(
                "expected ready frame, got {other:?}"
            ))
            .into()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(BatchError::WorkerStart {
                slot: self.slot,
                reason: "timed out waiting for worker handshake".into(),
            }),
        }
    }

    /// Kill the current worker process, if any.
    pub async fn end(&mut self) {
        self.writer = None;
        self.reader = None;
        if let Some(mut process) = self.process.take() {
            if process.is_alive() {
                process.kill().await;
            }
        }
    }
}

#[async_trait]
impl WorkerSlot for HealthyWorker {
    fn slot_index(&self) -> usize {
        self.slot
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    fn worker_name(&self) -> String {
        self.name.clone()
    }

    async fn send(&mut self, item: &WorkItem) -> Result<(), BatchError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            BatchError::Pool(format!("slot {} has no live worker", self.slot))
        })?;
        writer
            .write_frame(&WorkerRequest::Line(item.clone()))
            .await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<WorkerMessage>, BatchError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, reader.read_frame()).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(None),
        }
    }

    async fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    async fn restart(&mut self) -> Result<(), BatchError> {
        warn!(slot = self.slot, worker = %self.name, "replacing worker");
        self.end().await;
        self.start_new().await
    }

    async fn shutdown(&mut self) -> Result<(), BatchError> {
        self.end().await;
        Ok(())
    }
}
