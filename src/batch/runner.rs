//! The prewarm runner process.
//!
//! Under the prewarm strategy the controller spawns exactly one runner, which
//! resolves the flow a single time and then creates every slot worker itself,
//! handing each the resolved snapshot so workers skip the expensive flow
//! reload. The runner relays per-slot traffic between its own stdio and the
//! workers' stdio, watches its children, and honors the shared control-signal
//! channel (delete/restart per slot). It exits once every slot has been
//! deleted or its controller disappears.

use std::sync::Arc;

use tokio::process::ChildStdin;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::executor::FlowExecutorFactory;

use super::backend::WORKER_STARTUP_TIMEOUT;
use super::errors::BatchError;
use super::process::{ProcessHandle, WorkerLauncher};
use super::transport::{
    ControlSignal, FrameReader, FrameWriter, RunnerEvent, RunnerRequest, TransportError,
    WorkerInit, WorkerMessage, WorkerRequest,
};
use super::worker::{apply_init_diagnostics, ROLE_LINE, WORKER_ROLE_ENV, WORKER_SLOT_ENV};

struct SlotState {
    writer: Option<FrameWriter<ChildStdin>>,
    process: Option<ProcessHandle>,
    deleted: bool,
}

impl SlotState {
    fn empty() -> Self {
        Self {
            writer: None,
            process: None,
            deleted: false,
        }
    }
}

/// Entry point of the runner process.
pub(crate) async fn runner_main(factory: Arc<dyn FlowExecutorFactory>) -> Result<(), BatchError> {
    let mut reader = FrameReader::new(tokio::io::stdin());

    // One writer task serializes every event frame onto stdout.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<RunnerEvent>();
    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(tokio::io::stdout());
        while let Some(event) = event_rx.recv().await {
            if writer.write_frame(&event).await.is_err() {
                break;
            }
        }
    });

    let (init, slot_count) = match reader.read_frame::<RunnerRequest>().await? {
        Some(RunnerRequest::Init { init, slots }) => (init, slots),
        other => {
            return Err(
                TransportError::Handshake(format!("expected runner init, got {other:?}")).into(),
            )
        }
    };
    apply_init_diagnostics(&init);

    // The one expensive flow resolution of the whole pool.
    let snapshot = factory
        .snapshot()
        .await
        .map_err(|err| TransportError::Handshake(format!("flow resolution failed: {err}")))?;
    let child_init = WorkerInit {
        flow_snapshot: Some(snapshot),
        ..init
    };
    info!(slots = slot_count, "runner initialized, creating workers");

    let launcher = WorkerLauncher::current_exe()?;
    let mut slots: Vec<SlotState> = (0..slot_count).map(|_| SlotState::empty()).collect();
    for slot in 0..slot_count {
        spawn_slot(&launcher, &child_init, slot, &mut slots[slot], &event_tx).await;
    }

    loop {
        match reader.read_frame::<RunnerRequest>().await {
            Ok(Some(RunnerRequest::Line { slot, item })) => {
                let Some(state) = slots.get_mut(slot) else {
                    warn!(slot, "line for unknown slot dropped");
                    continue;
                };
                if let Some(writer) = state.writer.as_mut() {
                    if let Err(err) = writer.write_frame(&WorkerRequest::Line(item)).await {
                        // The relay task reports the death; the controller
                        // re-enqueues the item once it notices.
                        warn!(slot, error = %err, "failed to forward line to worker");
                    }
                } else {
                    warn!(slot, "line for slot without live worker dropped");
                }
            }
            Ok(Some(RunnerRequest::Control { slot, signal })) => {
                let Some(state) = slots.get_mut(slot) else {
                    warn!(slot, "control signal for unknown slot dropped");
                    continue;
                };
                kill_slot(state).await;
                match signal {
                    ControlSignal::Delete => {
                        state.deleted = true;
                        debug!(slot, "slot deleted");
                        if slots.iter().all(|s| s.deleted) {
                            info!("all slots deleted, runner exiting");
                            break;
                        }
                    }
                    ControlSignal::Restart => {
                        let state = &mut slots[slot];
                        spawn_slot(&launcher, &child_init, slot, state, &event_tx).await;
                    }
                }
            }
            Ok(Some(RunnerRequest::Init { .. })) => {
                warn!("duplicate runner init ignored");
            }
            Ok(None) => {
                info!("controller channel closed, runner exiting");
                break;
            }
            Err(err) => {
                error!(error = %err, "runner channel failed");
                break;
            }
        }
    }

    for state in &mut slots {
        kill_slot(state).await;
    }
    drop(event_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Create a fresh worker for `slot`, announce it, and start its relay.
async fn spawn_slot(
    launcher: &WorkerLauncher,
    child_init: &WorkerInit,
    slot: usize,
    state: &mut SlotState,
    events: &UnboundedSender<RunnerEvent>,
) {
    let spawned = match launcher.spawn(&[
        (WORKER_ROLE_ENV, ROLE_LINE.to_string()),
        (WORKER_SLOT_ENV, slot.to_string()),
    ]) {
        Ok(spawned) => spawned,
        Err(err) => {
            error!(slot, error = %err, "failed to spawn slot worker");
            return;
        }
    };

    let mut writer = FrameWriter::new(spawned.stdin);
    let mut child_reader = FrameReader::new(spawned.stdout);
    let mut handle = spawned.handle;
    let pid = handle.pid().unwrap_or_default();

    if let Err(err) = writer.write_frame(&WorkerRequest::Init(child_init.clone())).await {
        error!(slot, error = %err, "failed to initialize slot worker");
        handle.kill().await;
        return;
    }

    let ready = tokio::time::timeout(WORKER_STARTUP_TIMEOUT, child_reader.read_frame()).await;
    let name = match ready {
        Ok(Ok(Some(WorkerMessage::Ready { name, .. }))) => name,
        other => {
            error!(slot, ?other, "slot worker failed its handshake");
            handle.kill().await;
            return;
        }
    };

    let _ = events.send(RunnerEvent::Spawned { slot, pid, name });

    // Relay the worker's stream until it closes, then report the exit.
    let relay_events = events.clone();
    tokio::spawn(async move {
        loop {
            match child_reader.read_frame::<WorkerMessage>().await {
                Ok(Some(message)) => {
                    if relay_events
                        .send(RunnerEvent::Message { slot, message })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        let _ = relay_events.send(RunnerEvent::Exited { slot, pid, code: None });
    });

    state.writer = Some(writer);
    state.process = Some(handle);
}

async fn kill_slot(state: &mut SlotState) {
    state.writer = None;
    if let Some(mut process) = state.process.take() {
        if process.is_alive() {
            process.kill().await;
        }
    }
}
