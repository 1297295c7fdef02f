//! Service-backed workers for flows whose execution engine lives in another
//! runtime.
//!
//! Instead of re-running the host executable, each slot launches an external
//! worker service that listens on a local TCP port and speaks the same
//! newline-delimited JSON protocol as native workers. The dispatch loop does
//! not know the difference: submit line, await result, detect death.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{WorkerBackend, WorkerSlot};
use super::errors::BatchError;
use super::process::ProcessHandle;
use super::transport::{FrameReader, FrameWriter, WorkerInit, WorkerMessage, WorkerRequest};
use super::types::WorkItem;

/// Where the worker service finds its flow definition.
#[derive(Debug, Clone)]
pub enum FlowDefinition {
    /// An on-disk definition passed through as-is.
    File(PathBuf),
    /// An in-memory definition; the proxy writes it to a temporary file and
    /// removes that file when the worker is destroyed.
    Inline(serde_json::Value),
}

/// Launch parameters of one worker service.
#[derive(Debug, Clone)]
pub struct ServiceWorkerConfig {
    /// Executable implementing the worker service.
    pub command: PathBuf,
    /// Extra arguments placed before the standard ones.
    pub args: Vec<String>,
    /// Working directory of the service.
    pub working_dir: PathBuf,
    /// Where the service should write its own log.
    pub log_path: Option<PathBuf>,
    /// The flow the service executes.
    pub flow_definition: FlowDefinition,
    /// How long the service gets to come up.
    pub startup_timeout: Duration,
    /// Grace period between asking the service to exit and killing it.
    pub shutdown_grace: Duration,
}

impl ServiceWorkerConfig {
    /// A config with default timeouts (60s startup, 5s shutdown grace).
    pub fn new(
        command: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        flow_definition: FlowDefinition,
    ) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            log_path: None,
            flow_definition,
            startup_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Backs every slot with an external worker service process.
pub struct ServiceWorkerBackend {
    config: Arc<ServiceWorkerConfig>,
}

impl ServiceWorkerBackend {
    /// Launch slots from the given service configuration.
    pub fn new(config: ServiceWorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl WorkerBackend for ServiceWorkerBackend {
    fn name(&self) -> &'static str {
        "service"
    }

    fn shares_preloaded_flow(&self) -> bool {
        false
    }

    async fn start(
        &self,
        slots: usize,
        init: WorkerInit,
    ) -> Result<Vec<Box<dyn WorkerSlot>>, BatchError> {
        let mut handles: Vec<Box<dyn WorkerSlot>> = Vec::with_capacity(slots);
        for slot in 0..slots {
            let mut worker = ServiceWorkerSlot::new(slot, self.config.clone(), init.clone());
            worker.launch().await?;
            handles.push(Box::new(worker));
        }
        Ok(handles)
    }
}

/// One slot backed by an external worker service.
pub struct ServiceWorkerSlot {
    slot: usize,
    config: Arc<ServiceWorkerConfig>,
    init: WorkerInit,
    process: Option<ProcessHandle>,
    reader: Option<FrameReader<OwnedReadHalf>>,
    writer: Option<FrameWriter<OwnedWriteHalf>>,
    temp_flow: Option<tempfile::NamedTempFile>,
    name: String,
}

impl ServiceWorkerSlot {
    fn new(slot: usize, config: Arc<ServiceWorkerConfig>, init: WorkerInit) -> Self {
        Self {
            slot,
            config,
            init,
            process: None,
            reader: None,
            writer: None,
            temp_flow: None,
            name: format!("Service-{slot}-unstarted"),
        }
    }

    /// Allocate a port, start the service, and wait for it to become usable.
    async fn launch(&mut self) -> Result<(), BatchError> {
        let port = find_available_port()?;
        let flow_path = self.materialize_flow_definition()?;
        let init_error_file = self
            .config
            .working_dir
            .join(format!("init_error_{}.json", Uuid::new_v4()));
        std::fs::write(&init_error_file, b"")?;

        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg("--port")
            .arg(port.to_string())
            .arg("--flow-file")
            .arg(&flow_path)
            .arg("--error-file")
            .arg(&init_error_file)
            .current_dir(&self.config.working_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(log_path) = &self.config.log_path {
            command.arg("--log-path").arg(log_path);
        }

        info!(slot = self.slot, command = %self.config.command.display(), port, "starting worker service");
        let child = command
            .spawn()
            .map_err(|err| BatchError::WorkerStart {
                slot: self.slot,
                reason: format!("failed to launch {}: {err}", self.config.command.display()),
            })?;
        let mut handle = ProcessHandle::new(child);

        let startup = self.ensure_startup(&mut handle, port, &init_error_file).await;
        // The error file only matters during startup.
        let _ = std::fs::remove_file(&init_error_file);

        match startup {
            Ok(()) => {
                self.process = Some(handle);
                Ok(())
            }
            Err(err) => {
                handle.kill().await;
                Err(err)
            }
        }
    }

    /// Poll the init-error file and the port until the service answers its
    /// handshake or the startup deadline passes.
    async fn ensure_startup(
        &mut self,
        handle: &mut ProcessHandle,
        port: u16,
        init_error_file: &Path,
    ) -> Result<(), BatchError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let stream = loop {
            if let Ok(contents) = std::fs::read_to_string(init_error_file) {
                if !contents.trim().is_empty() {
                    return Err(BatchError::WorkerStart {
                        slot: self.slot,
                        reason: format!("service reported an initialization error: {contents}"),
                    });
                }
            }
            if !handle.is_alive() {
                return Err(BatchError::WorkerStart {
                    slot: self.slot,
                    reason: format!(
                        "service exited during startup with code {:?}",
                        handle.exit_code()
                    ),
                });
            }
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(err) => debug!(slot = self.slot, error = %err, "service port not ready yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BatchError::WorkerStart {
                    slot: self.slot,
                    reason: format!("service did not open port {port} in time"),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        writer
            .write_frame(&WorkerRequest::Init(self.init.clone()))
            .await?;

        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::from_secs(1));
        match tokio::time::timeout(remaining, reader.read_frame()).await {
            Ok(Ok(Some(WorkerMessage::Ready { pid, name }))) => {
                info!(slot = self.slot, pid, name = %name, "worker service ready");
                self.name = name;
                self.reader = Some(reader);
                self.writer = Some(writer);
                Ok(())
            }
            other => Err(BatchError::WorkerStart {
                slot: self.slot,
                reason: format!("service handshake failed: {other:?}"),
            }),
        }
    }

    fn materialize_flow_definition(&mut self) -> Result<PathBuf, BatchError> {
        match &self.config.flow_definition {
            FlowDefinition::File(path) => Ok(path.clone()),
            FlowDefinition::Inline(value) => {
                let file = tempfile::Builder::new()
                    .prefix("flow_definition_")
                    .suffix(".json")
                    .tempfile()?;
                std::fs::write(file.path(), serde_json::to_vec_pretty(value).map_err(
                    |err| BatchError::Pool(format!("unserializable flow definition: {err}")),
                )?)?;
                let path = file.path().to_path_buf();
                self.temp_flow = Some(file);
                Ok(path)
            }
        }
    }

    /// Stop the service: graceful terminate, then kill after the grace
    /// period, then clean up any temporary flow definition.
    async fn destroy(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Some(mut process) = self.process.take() {
            process.terminate(self.config.shutdown_grace).await;
        }
        if let Some(temp_flow) = self.temp_flow.take() {
            if let Err(err) = temp_flow.close() {
                warn!(slot = self.slot, error = %err, "failed to remove temporary flow definition");
            }
        }
    }
}

#[async_trait]
impl WorkerSlot for ServiceWorkerSlot {
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
            BatchError::Pool(format!("service slot {} is not connected", self.slot))
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
        warn!(slot = self.slot, service = %self.name, "replacing worker service");
        self.destroy().await;
        self.launch().await
    }

    async fn shutdown(&mut self) -> Result<(), BatchError> {
        self.destroy().await;
        Ok(())
    }
}

/// Ask the OS for a free local port.
fn find_available_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_ports_are_distinct_enough() {
        let a = find_available_port().unwrap();
        let b = find_available_port().unwrap();
        assert!(a > 0);
        assert!(b > 0);
    }

    #[test]
    fn inline_definition_lands_in_a_temp_file() {
        let config = ServiceWorkerConfig::new(
            "worker-service",
            std::env::temp_dir(),
            FlowDefinition::Inline(serde_json::json!({"entry": "flow:main"})),
        );
        let init = WorkerInit {
            operation_context: Default::default(),
            log_filter: None,
            flow_snapshot: None,
        };
        let mut slot = ServiceWorkerSlot::new(0, Arc::new(config), init);
        let path = slot.materialize_flow_definition().unwrap();
        assert!(path.is_file());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("flow:main"));

        slot.temp_flow.take().unwrap().close().unwrap();
        assert!(!path.exists());
    }
}
