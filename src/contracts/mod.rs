//! Data contracts shared between the pool, the workers and the storage layer.
//!
//! Everything in this module crosses a process boundary at some point, so all
//! types are serde-serializable and carry no handles or callbacks.

mod error_record;
mod line_result;
mod run_info;

pub use error_record::ErrorRecord;
pub use line_result::{LineResult, LINE_NUMBER_KEY};
pub use run_info::{FlowRunInfo, NodeRunInfo, Status};

/// A JSON object mapping, the shape of flow inputs and outputs.
pub type Mapping = serde_json::Map<String, serde_json::Value>;
