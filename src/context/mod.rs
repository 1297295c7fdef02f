//! Operation context: diagnostic key/value state that follows a run across
//! process boundaries.
//!
//! The context is an explicit snapshot, not implicitly inherited global state:
//! the controller captures it with [`OperationContext::current`], ships it to
//! each worker in the spawn handshake, and the worker restores it with
//! [`OperationContext::make_current`] before executing any line.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Environment variable appended to the user agent when set.
pub const USER_AGENT_ENV: &str = "LINEFLOW_USER_AGENT";

fn context_slot() -> &'static RwLock<OperationContext> {
    static SLOT: OnceLock<RwLock<OperationContext>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(OperationContext::default()))
}

/// String-keyed context attached to every run for logging and telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    values: BTreeMap<String, String>,
}

impl OperationContext {
    /// Snapshot of the process-wide context.
    pub fn current() -> Self {
        context_slot().read().clone()
    }

    /// Install this snapshot as the process-wide context.
    ///
    /// Called once at worker startup with the snapshot shipped from the
    /// controller; the previous contents are replaced wholesale.
    pub fn make_current(self) {
        *context_slot().write() = self;
    }

    /// Merge `values` into the process-wide context.
    pub fn update_current(values: BTreeMap<String, String>) {
        context_slot().write().values.extend(values);
    }

    /// Look up a context value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a context value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove a context value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Number of entries in the context.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context carries no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Append user-agent information if it is not already present.
    pub fn append_user_agent(&mut self, user_agent: &str) {
        let agent = self.values.get("user_agent").cloned().unwrap_or_default();
        let user_agent = user_agent.trim();
        if !agent.contains(user_agent) {
            let merged = format!("{agent} {user_agent}").trim().to_string();
            self.values.insert("user_agent".into(), merged);
        }
    }

    /// The full user agent string: stored agent, the crate's own identifier,
    /// and any override from the environment.
    pub fn user_agent(&self) -> String {
        let agent = self.values.get("user_agent").cloned().unwrap_or_default();
        let mut parts = vec![agent.clone()];
        let own = format!("lineflow/{}", env!("CARGO_PKG_VERSION"));
        if !agent.contains(&own) {
            parts.push(own);
        }
        if let Ok(extra) = std::env::var(USER_AGENT_ENV) {
            let extra = extra.trim().to_string();
            if !extra.is_empty() && !agent.contains(&extra) {
                parts.push(extra);
            }
        }
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}
