//! Small helpers shared across the engine.

use std::time::Duration;

/// Parse an integer environment variable, returning `None` when unset or
/// unparsable.
pub fn int_from_env(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Parse a positive integer environment variable.
///
/// Zero and negative values are treated as unset, matching the worker-count
/// override semantics.
pub fn positive_from_env(name: &str) -> Option<usize> {
    let value = int_from_env(name)?;
    usize::try_from(value).ok().filter(|v| *v > 0)
}

/// Parse a duration in whole seconds from the environment.
pub fn duration_secs_from_env(name: &str) -> Option<Duration> {
    positive_from_env(name).map(|secs| Duration::from_secs(secs as u64))
}
