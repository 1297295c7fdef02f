use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contracts::Mapping;
use crate::utils;

/// Environment variable overriding the resolved worker count.
pub const WORKER_COUNT_ENV: &str = "LINEFLOW_WORKER_COUNT";
/// Environment variable overriding the worker creation strategy.
pub const START_METHOD_ENV: &str = "LINEFLOW_BATCH_METHOD";
/// Environment variable overriding the per-line timeout in seconds.
pub const LINE_TIMEOUT_ENV: &str = "LINEFLOW_LINE_TIMEOUT_SEC";
/// Environment variable overriding the progress log interval in seconds.
pub const LOG_INTERVAL_ENV: &str = "LINEFLOW_LOG_INTERVAL_SEC";

/// Hard ceiling on the worker count when no override is given.
pub const DEFAULT_WORKER_COUNT: usize = 16;
/// Default wall-clock budget for one line.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default interval between progress log lines.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// One line of the batch, queued for execution.
///
/// Immutable once enqueued; `(run_id, line_index)` identifies it uniquely.
/// A crashed worker causes the same item to be re-enqueued, never a copy
/// with different contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Line inputs.
    pub inputs: Mapping,
    /// Zero-based index of the line in the dataset.
    pub line_index: u64,
    /// The batch run this line belongs to.
    pub run_id: String,
    /// Selected node variant, if any.
    pub variant_id: Option<String>,
    /// Whether the executor should validate inputs against the flow schema.
    pub validate_inputs: bool,
}

/// How worker processes are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartMethod {
    /// One runner process resolves the flow once and creates every worker
    /// itself, handing each the pre-resolved snapshot. Cheap worker creation,
    /// the platform default on unix.
    Prewarm,
    /// Each worker is spawned fresh and re-initializes the flow from its
    /// definition. The only option on platforms without a prewarm-capable
    /// process model.
    ColdStart,
}

impl StartMethod {
    /// The platform's default strategy.
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            StartMethod::Prewarm
        } else {
            StartMethod::ColdStart
        }
    }

    /// Resolve the strategy from the environment override, falling back to
    /// the platform default with a warning when the override is invalid.
    pub fn resolve() -> Self {
        match std::env::var(START_METHOD_ENV) {
            Ok(raw) => match raw.trim().parse() {
                Ok(method) => {
                    info!(method = ?method, "worker start method set from {START_METHOD_ENV}");
                    method
                }
                Err(()) => {
                    let default = Self::platform_default();
                    warn!(
                        value = %raw,
                        "invalid {START_METHOD_ENV} value, falling back to platform default {default:?}"
                    );
                    default
                }
            },
            Err(_) => Self::platform_default(),
        }
    }
}

impl std::str::FromStr for StartMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prewarm" => Ok(StartMethod::Prewarm),
            "coldstart" | "cold-start" | "cold_start" => Ok(StartMethod::ColdStart),
            _ => Err(()),
        }
    }
}

/// Tunables of one batch pool, resolved from the environment by default.
#[derive(Debug, Clone)]
pub struct BatchPoolConfig {
    /// Explicit worker-count override; `None` resolves from row count and
    /// available memory.
    pub worker_count: Option<usize>,
    /// Explicit strategy override; `None` resolves from the environment and
    /// platform.
    pub start_method: Option<StartMethod>,
    /// Wall-clock budget for one line; exceeding it yields a Failed result
    /// with a timeout error.
    pub line_timeout: Duration,
    /// Interval between periodic progress log lines.
    pub log_interval: Duration,
    /// Directory multimedia payloads are externalized into; `None` keeps
    /// payloads inline.
    pub output_dir: Option<PathBuf>,
}

impl BatchPoolConfig {
    /// Read every knob from the environment.
    pub fn from_env() -> Self {
        Self {
            worker_count: utils::positive_from_env(WORKER_COUNT_ENV),
            start_method: std::env::var(START_METHOD_ENV)
                .ok()
                .and_then(|raw| raw.trim().parse().ok()),
            line_timeout: utils::duration_secs_from_env(LINE_TIMEOUT_ENV)
                .unwrap_or(DEFAULT_LINE_TIMEOUT),
            log_interval: utils::duration_secs_from_env(LOG_INTERVAL_ENV)
                .unwrap_or(DEFAULT_LOG_INTERVAL),
            output_dir: None,
        }
    }

    /// Set the per-line timeout.
    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    /// Set the progress log interval.
    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    /// Set an explicit worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count.max(1));
        self
    }

    /// Set an explicit worker creation strategy.
    pub fn with_start_method(mut self, method: StartMethod) -> Self {
        self.start_method = Some(method);
        self
    }

    /// Set the multimedia output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

impl Default for BatchPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            start_method: None,
            line_timeout: DEFAULT_LINE_TIMEOUT,
            log_interval: DEFAULT_LOG_INTERVAL,
            output_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_method_parses_known_names() {
        assert_eq!("prewarm".parse(), Ok(StartMethod::Prewarm));
        assert_eq!("ColdStart".parse(), Ok(StartMethod::ColdStart));
        assert_eq!("cold-start".parse(), Ok(StartMethod::ColdStart));
        assert_eq!("fork".parse::<StartMethod>(), Err(()));
    }

    #[test]
    fn config_builders_compose() {
        let config = BatchPoolConfig::default()
            .with_line_timeout(Duration::from_secs(5))
            .with_worker_count(3)
            .with_start_method(StartMethod::ColdStart);
        assert_eq!(config.line_timeout, Duration::from_secs(5));
        assert_eq!(config.worker_count, Some(3));
        assert_eq!(config.start_method, Some(StartMethod::ColdStart));
    }
}
