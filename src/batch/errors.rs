use thiserror::Error;

use super::transport::TransportError;

/// Errors of the batch pool and its dispatch loops.
///
/// Per-line failures never surface here; they are absorbed into Failed line
/// results. What does surface is fatal to the whole batch run, with one
/// exception: [`BatchError::Interrupted`] is the user asking the run to stop
/// and is re-raised without wrapping.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A line exceeded its wall-clock budget. Used to build the synthesized
    /// Failed result; never escapes `run()`.
    #[error("line {line} timed out after {timeout_secs} seconds")]
    LineTimeout {
        /// Index of the timed-out line.
        line: u64,
        /// The configured per-line timeout.
        timeout_secs: u64,
    },

    /// The batch input contained the same line index twice.
    #[error("duplicate line index {0} in batch input")]
    DuplicateLineIndex(u64),

    /// Pool infrastructure failed; the causing error is rendered into the
    /// message. Fatal to the batch run.
    #[error("worker pool failure: {0}")]
    Pool(String),

    /// A worker could not be created or replaced.
    #[error("failed to start worker for slot {slot}: {reason}")]
    WorkerStart {
        /// Slot the worker was meant to fill.
        slot: usize,
        /// Why the start failed.
        reason: String,
    },

    /// The run was interrupted by the user (Ctrl-C).
    #[error("batch run interrupted")]
    Interrupted,

    /// Channel or wire-format failure talking to a worker.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Filesystem or process-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_line_and_budget() {
        let err = BatchError::LineTimeout { line: 12, timeout_secs: 600 };
        assert_eq!(err.to_string(), "line 12 timed out after 600 seconds");
    }
}
