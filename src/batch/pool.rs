//! The batch pool controller.
//!
//! [`LineExecutionPool`] is the public entry point of the engine: it takes an
//! ordered set of input lines, fans them out across a pool of worker
//! processes, and blocks until every line is accounted for: completed,
//! failed, or timed out. Lines come back in completion order; callers reorder
//! by `run_info.index` when they need dataset order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::contracts::{LineResult, Mapping};
use crate::storage::{NoopRunStorage, RunStorage};

use super::backend::WorkerBackend;
use super::dispatch::{dispatch_loop, DispatchContext};
use super::errors::BatchError;
use super::prewarm::PrewarmBackend;
use super::process::WorkerLauncher;
use super::queue::PendingQueue;
use super::spawn::ColdStartBackend;
use super::transport::WorkerInit;
use super::types::{BatchPoolConfig, StartMethod, WorkItem, DEFAULT_WORKER_COUNT};

/// Multi-process pool executing one flow over a batch of input lines.
///
/// The pool itself never touches the flow: worker processes build their own
/// executor through the factory the host hands to
/// [`maybe_run_worker`](super::maybe_run_worker).
pub struct LineExecutionPool {
    flow_id: String,
    run_id: String,
    variant_id: Option<String>,
    validate_inputs: bool,
    storage: Arc<dyn RunStorage>,
    config: BatchPoolConfig,
    backend: Option<Arc<dyn WorkerBackend>>,
}

impl LineExecutionPool {
    /// A pool for one flow and one batch run identifier.
    ///
    /// Configuration knobs default to the environment
    /// ([`BatchPoolConfig::from_env`]); run records go nowhere until a real
    /// sink is attached with [`with_storage`](Self::with_storage).
    pub fn new(flow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_id: run_id.into(),
            variant_id: None,
            validate_inputs: true,
            storage: Arc::new(NoopRunStorage),
            config: BatchPoolConfig::from_env(),
            backend: None,
        }
    }

    /// Attach the sink streamed run records are persisted into.
    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Select a node variant for every line.
    pub fn with_variant_id(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    /// Control executor-side input validation.
    pub fn with_validate_inputs(mut self, validate: bool) -> Self {
        self.validate_inputs = validate;
        self
    }

    /// Replace the environment-derived configuration.
    pub fn with_config(mut self, config: BatchPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific worker backend instead of resolving one from the
    /// configured start method.
    pub fn with_backend(mut self, backend: Arc<dyn WorkerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Execute every line of `batch_inputs` and return one result per line.
    ///
    /// The returned list is complete but in completion order. Per-line
    /// failures (tool errors, crashes, timeouts) are absorbed into Failed
    /// results; only pool-infrastructure failures and interruption surface as
    /// errors.
    pub async fn run(&self, batch_inputs: Vec<(u64, Mapping)>) -> crate::Result<Vec<LineResult>> {
        if batch_inputs.is_empty() {
            info!("no lines to execute");
            return Ok(Vec::new());
        }

        let mut seen = std::collections::HashSet::new();
        for (index, _) in &batch_inputs {
            if !seen.insert(*index) {
                return Err(BatchError::DuplicateLineIndex(*index).into());
            }
        }

        let backend = self.resolve_backend()?;
        let total_lines = batch_inputs.len();
        let worker_count = self.determine_worker_count(total_lines, backend.shares_preloaded_flow());
        info!(
            backend = backend.name(),
            workers = worker_count,
            lines = total_lines,
            run_id = %self.run_id,
            "starting batch run"
        );

        let queue = Arc::new(PendingQueue::new());
        for (index, inputs) in batch_inputs {
            queue.push(WorkItem {
                inputs,
                line_index: index,
                run_id: self.run_id.clone(),
                variant_id: self.variant_id.clone(),
                validate_inputs: self.validate_inputs,
            });
        }

        let ctx = Arc::new(DispatchContext {
            flow_id: self.flow_id.clone(),
            queue,
            storage: self.storage.clone(),
            results: Arc::new(Mutex::new(Vec::with_capacity(total_lines))),
            processing: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
            line_timeout: self.config.line_timeout,
            output_dir: self.config.output_dir.clone(),
            total_lines,
        });

        let slots = backend.start(worker_count, WorkerInit::capture()).await?;

        let active = Arc::new(AtomicUsize::new(worker_count));
        let mut dispatchers = JoinSet::new();
        for slot in slots {
            let ctx = ctx.clone();
            let active = active.clone();
            dispatchers.spawn(async move {
                let outcome = dispatch_loop(ctx, slot).await;
                active.fetch_sub(1, Ordering::SeqCst);
                outcome
            });
        }

        let reporter = spawn_progress_reporter(
            self.config.log_interval,
            worker_count,
            active,
            ctx.clone(),
        );

        let run_result = tokio::select! {
            outcome = drain_dispatchers(&mut dispatchers) => outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("batch run interrupted, terminating workers");
                Err(BatchError::Interrupted)
            }
        };
        reporter.abort();

        match run_result {
            Ok(()) => {
                backend.shutdown().await?;
                let results = std::mem::take(&mut *ctx.results.lock());
                info!(
                    results = results.len(),
                    lines = total_lines,
                    "batch run finished"
                );
                Ok(results)
            }
            Err(err) => {
                // Dropping the dispatchers and slot handles kills every
                // worker process; nothing graceful is owed here.
                dispatchers.abort_all();
                Err(err.into())
            }
        }
    }

    fn resolve_backend(&self) -> Result<Arc<dyn WorkerBackend>, BatchError> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }
        let method = self.config.start_method.unwrap_or_else(StartMethod::resolve);
        let launcher = WorkerLauncher::current_exe()?;
        Ok(match method {
            StartMethod::Prewarm => Arc::new(PrewarmBackend::new(launcher)),
            StartMethod::ColdStart => Arc::new(ColdStartBackend::new(launcher)),
        })
    }

    fn determine_worker_count(&self, rows: usize, shares_preloaded_flow: bool) -> usize {
        let memory_estimate = if shares_preloaded_flow {
            None
        } else {
            estimate_worker_count_from_memory()
        };
        resolve_worker_count(self.config.worker_count, rows, memory_estimate)
    }
}

/// Pick the slot count from the override and the bounding factors.
///
/// An explicit override wins outright; otherwise the count is the minimum of
/// the fixed ceiling, the row count, and the memory-based estimate when one
/// applies.
pub(crate) fn resolve_worker_count(
    explicit: Option<usize>,
    rows: usize,
    memory_estimate: Option<usize>,
) -> usize {
    if let Some(count) = explicit {
        info!("Set worker count to {count} with the explicit override.");
        if let Some(estimate) = memory_estimate {
            if estimate < count {
                warn!(
                    "The configured worker count ({count}) is larger than the recommended count \
                     ({estimate}) estimated from available memory. This may cause memory exhaustion."
                );
            }
        }
        return count;
    }

    let mut factors = vec![
        ("default_worker_count", DEFAULT_WORKER_COUNT),
        ("row_count", rows),
    ];
    if let Some(estimate) = memory_estimate {
        factors.push(("estimated_worker_count_based_on_memory_usage", estimate));
    }
    let count = factors
        .iter()
        .map(|(_, value)| *value)
        .filter(|value| *value > 0)
        .min()
        .unwrap_or(1);
    info!(?factors, "Set worker count to {count} by taking the minimum of the factors.");
    count
}

/// Estimate how many flow-loading workers fit in memory: available system
/// memory divided by this process's resident footprint.
fn estimate_worker_count_from_memory() -> Option<usize> {
    let mut sys = System::new();
    sys.refresh_memory();
    let pid = sysinfo::get_current_pid().ok()?;
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let available = sys.available_memory();
    let resident = sys.process(pid)?.memory().max(1);
    let estimate = (available / resident) as usize;
    if estimate < 1 {
        warn!(
            available_bytes = available,
            process_bytes = resident,
            "available memory is below one process footprint, clamping worker estimate to 1"
        );
        Some(1)
    } else {
        info!(
            available_bytes = available,
            process_bytes = resident,
            estimate,
            "estimated worker count from available memory"
        );
        Some(estimate)
    }
}

async fn drain_dispatchers(
    dispatchers: &mut JoinSet<Result<(), BatchError>>,
) -> Result<(), BatchError> {
    while let Some(joined) = dispatchers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "dispatch loop failed");
                return Err(BatchError::Pool(err.to_string()));
            }
            Err(join_err) => {
                error!(error = %join_err, "dispatch loop panicked");
                return Err(BatchError::Pool(join_err.to_string()));
            }
        }
    }
    Ok(())
}

/// Periodic status lines: active workers, line counts, in-flight lines.
fn spawn_progress_reporter(
    interval: std::time::Duration,
    worker_count: usize,
    active: Arc<AtomicUsize>,
    ctx: Arc<DispatchContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            let finished = ctx.completed.len();
            let processing = ctx.processing.len();
            info!(
                "[Worker pool] [Active workers: {} / {}]",
                active.load(Ordering::SeqCst),
                worker_count
            );
            info!(
                "[Lines] [Finished: {finished}] [Processing: {processing}] [Pending: {}]",
                ctx.total_lines.saturating_sub(finished + processing)
            );
            let mut in_flight: Vec<(u64, String)> = ctx
                .processing
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect();
            if !in_flight.is_empty() {
                in_flight.sort_by_key(|(line, _)| *line);
                let listing = in_flight
                    .iter()
                    .map(|(line, descriptor)| format!("line {line} ({descriptor})"))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!("Processing lines: {listing}.");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_of_factors_wins_without_override() {
        assert_eq!(resolve_worker_count(None, 3, Some(10)), 3);
        assert_eq!(resolve_worker_count(None, 100, Some(10)), 10);
        assert_eq!(resolve_worker_count(None, 100, None), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn explicit_override_wins_even_over_memory_estimate() {
        assert_eq!(resolve_worker_count(Some(32), 3, Some(10)), 32);
        assert_eq!(resolve_worker_count(Some(1), 100, None), 1);
    }
}
