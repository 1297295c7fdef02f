//! Prewarm worker strategy, controller side.
//!
//! One runner process (see [`super::runner`]) owns every worker; the
//! controller talks to it over multiplexed stdio frames. Each
//! [`PrewarmSlot`] demultiplexes its own traffic: worker messages on one
//! channel, spawn/exit lifecycle events on another, with restart and delete
//! requests going out on the shared control-signal channel.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::ChildStdin;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::backend::{WorkerBackend, WorkerSlot, WORKER_STARTUP_TIMEOUT};
use super::errors::BatchError;
use super::process::{ProcessHandle, WorkerLauncher};
use super::transport::{
    ControlSignal, FrameReader, FrameWriter, RunnerEvent, RunnerRequest, WorkerInit, WorkerMessage,
};
use super::types::WorkItem;
use super::worker::{ROLE_RUNNER, WORKER_ROLE_ENV};

/// How long a deleted slot gets to disappear before shutdown gives up.
const SLOT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the runner gets to exit after all slots are deleted.
const RUNNER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

type SharedRunnerWriter = std::sync::Arc<tokio::sync::Mutex<FrameWriter<ChildStdin>>>;

/// Lifecycle notifications for one slot, split off the runner event stream.
#[derive(Debug)]
enum SlotEvent {
    Spawned { pid: u32, name: String },
    Exited { pid: u32 },
}

struct RunnerShared {
    process: ProcessHandle,
    writer: SharedRunnerWriter,
    demux: JoinHandle<()>,
}

/// Creates all workers through one prewarmed runner process.
pub struct PrewarmBackend {
    launcher: WorkerLauncher,
    shared: Mutex<Option<RunnerShared>>,
}

impl PrewarmBackend {
    /// Back the runner with the given launcher.
    pub fn new(launcher: WorkerLauncher) -> Self {
        Self {
            launcher,
            shared: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkerBackend for PrewarmBackend {
    fn name(&self) -> &'static str {
        "prewarm"
    }

    fn shares_preloaded_flow(&self) -> bool {
        true
    }

    async fn start(
        &self,
        slots: usize,
        init: WorkerInit,
    ) -> Result<Vec<Box<dyn WorkerSlot>>, BatchError> {
        let spawned = self
            .launcher
            .spawn(&[(WORKER_ROLE_ENV, ROLE_RUNNER.to_string())])?;

        let writer: SharedRunnerWriter =
            std::sync::Arc::new(tokio::sync::Mutex::new(FrameWriter::new(spawned.stdin)));
        let mut runner_reader = FrameReader::new(spawned.stdout);

        let mut event_channels = Vec::with_capacity(slots);
        let mut message_channels = Vec::with_capacity(slots);
        let mut slot_handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
            let (message_tx, message_rx) = tokio::sync::mpsc::unbounded_channel();
            event_channels.push(event_tx);
            message_channels.push(message_tx);
            slot_handles.push(PrewarmSlot {
                slot,
                writer: writer.clone(),
                events: event_rx,
                messages: message_rx,
                pid: None,
                name: format!("Worker-{slot}-unstarted"),
                alive: false,
            });
        }

        // Route the runner's multiplexed event stream out to the slots.
        let demux = tokio::spawn(async move {
            loop {
                match runner_reader.read_frame::<RunnerEvent>().await {
                    Ok(Some(RunnerEvent::Spawned { slot, pid, name })) => {
                        if let Some(events) = event_channels.get(slot) {
                            let _ = events.send(SlotEvent::Spawned { pid, name });
                        }
                    }
                    Ok(Some(RunnerEvent::Exited { slot, pid, .. })) => {
                        if let Some(events) = event_channels.get(slot) {
                            let _ = events.send(SlotEvent::Exited { pid });
                        }
                    }
                    Ok(Some(RunnerEvent::Message { slot, message })) => {
                        if let Some(messages) = message_channels.get(slot) {
                            let _ = messages.send(message);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        writer
            .lock()
            .await
            .write_frame(&RunnerRequest::Init { init, slots })
            .await?;

        for slot_handle in &mut slot_handles {
            slot_handle.await_spawned(WORKER_STARTUP_TIMEOUT).await?;
        }

        *self.shared.lock() = Some(RunnerShared {
            process: spawned.handle,
            writer,
            demux,
        });

        Ok(slot_handles
            .into_iter()
            .map(|handle| Box::new(handle) as Box<dyn WorkerSlot>)
            .collect())
    }

    async fn shutdown(&self) -> Result<(), BatchError> {
        let Some(shared) = self.shared.lock().take() else {
            return Ok(());
        };
        let RunnerShared { mut process, writer, demux } = shared;

        // Closing the runner's stdin tells it to exit if the per-slot delete
        // signals have not already.
        drop(writer);
        if process.wait(RUNNER_EXIT_TIMEOUT).await.is_none() {
            warn!("runner did not exit in time, killing it");
            process.kill().await;
        }
        demux.abort();
        Ok(())
    }
}

/// One slot of the prewarm pool.
pub struct PrewarmSlot {
    slot: usize,
    writer: SharedRunnerWriter,
    events: UnboundedReceiver<SlotEvent>,
    messages: UnboundedReceiver<WorkerMessage>,
    pid: Option<u32>,
    name: String,
    alive: bool,
}

impl PrewarmSlot {
    /// Apply queued lifecycle events without blocking.
    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Spawned { pid, name } => {
                debug!(slot = self.slot, pid, name = %name, "slot worker spawned");
                self.pid = Some(pid);
                self.name = name;
                self.alive = true;
            }
            SlotEvent::Exited { pid } => {
                // Exit notices from an already-replaced generation are stale.
                if self.pid == Some(pid) {
                    self.alive = false;
                }
            }
        }
    }

    /// Wait until the runner announces a fresh worker for this slot.
    async fn await_spawned(&mut self, timeout: Duration) -> Result<(), BatchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(BatchError::WorkerStart {
                    slot: self.slot,
                    reason: "timed out waiting for runner to spawn worker".into(),
                })?;
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => {
                    let was_spawn = matches!(event, SlotEvent::Spawned { .. });
                    self.apply_event(event);
                    if was_spawn {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    return Err(BatchError::WorkerStart {
                        slot: self.slot,
                        reason: "runner event stream closed".into(),
                    })
                }
                Err(_) => {
                    return Err(BatchError::WorkerStart {
                        slot: self.slot,
                        reason: "timed out waiting for runner to spawn worker".into(),
                    })
                }
            }
        }
    }

    async fn send_control(&self, signal: ControlSignal) -> Result<(), BatchError> {
        self.writer
            .lock()
            .await
            .write_frame(&RunnerRequest::Control {
                slot: self.slot,
                signal,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerSlot for PrewarmSlot {
    fn slot_index(&self) -> usize {
        self.slot
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn worker_name(&self) -> String {
        self.name.clone()
    }

    async fn send(&mut self, item: &WorkItem) -> Result<(), BatchError> {
        self.writer
            .lock()
            .await
            .write_frame(&RunnerRequest::Line {
                slot: self.slot,
                item: item.clone(),
            })
            .await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<WorkerMessage>, BatchError> {
        self.drain_events();
        match tokio::time::timeout(timeout, self.messages.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn is_alive(&mut self) -> bool {
        self.drain_events();
        self.alive
    }

    async fn restart(&mut self) -> Result<(), BatchError> {
        warn!(slot = self.slot, worker = %self.name, "requesting slot restart");
        // Anything still buffered belongs to the generation being replaced.
        while self.messages.try_recv().is_ok() {}
        self.send_control(ControlSignal::Restart).await?;
        self.await_spawned(WORKER_STARTUP_TIMEOUT).await
    }

    async fn shutdown(&mut self) -> Result<(), BatchError> {
        let was_alive = {
            self.drain_events();
            self.alive
        };
        // The delete signal always goes out: the runner counts deleted slots
        // to decide when it may exit.
        self.send_control(ControlSignal::Delete).await?;
        if was_alive {
            let deadline = tokio::time::Instant::now() + SLOT_EXIT_TIMEOUT;
            while self.alive {
                let Some(remaining) =
                    deadline.checked_duration_since(tokio::time::Instant::now())
                else {
                    warn!(slot = self.slot, "slot did not confirm exit in time");
                    break;
                };
                match tokio::time::timeout(remaining, self.events.recv()).await {
                    Ok(Some(event)) => self.apply_event(event),
                    Ok(None) | Err(_) => break,
                }
            }
        }
        Ok(())
    }
}
