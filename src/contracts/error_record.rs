use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured presentation of an error, suitable for run records.
///
/// Run records cross process boundaries, so errors are flattened into plain
/// data here: the error type name, its message, and the rendered source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Short type name of the error, e.g. `LineTimeout`.
    pub error_type: String,
    /// Top-level error message.
    pub message: String,
    /// Messages of the error's source chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_chain: Vec<String>,
}

impl ErrorRecord {
    /// Build a record from a type name and message.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            source_chain: Vec::new(),
        }
    }

    /// Build a record from any error, walking its source chain.
    pub fn from_error(error_type: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut source_chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            source_chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            error_type: error_type.into(),
            message: err.to_string(),
            source_chain,
        }
    }

    /// Serialize into the JSON shape stored in `run_info.error`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}
