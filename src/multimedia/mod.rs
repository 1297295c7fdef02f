//! Multimedia externalization.
//!
//! Long batch runs accumulate decoded images inside line outputs and run
//! records. To bound memory, the pool rewrites every in-memory payload into a
//! file-path reference before a result enters the shared collection.
//!
//! An in-memory image is a single-entry object
//! `{"data:image/<fmt>;base64": "<payload>"}`; its externalized form is
//! `{"data:image/<fmt>;path": "<file name>"}` with the decoded bytes written
//! under the pool's output directory.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::contracts::{FlowRunInfo, LineResult, NodeRunInfo};

const MIME_PREFIX: &str = "data:image/";
const BASE64_SUFFIX: &str = ";base64";
const PATH_SUFFIX: &str = ";path";

/// Errors raised while writing payloads out to disk.
#[derive(Debug, Error)]
pub enum MultimediaError {
    /// The payload was not valid base64.
    #[error("invalid base64 image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The decoded payload could not be written.
    #[error("failed to persist image payload: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrite every in-memory image payload in `result` into a path reference.
///
/// Covers the line output and the inputs/outputs of the flow and node run
/// records. Failures to persist a single payload are logged and leave that
/// payload in place; externalization is best effort and never fails a line.
pub fn externalize_line_result(result: &mut LineResult, output_dir: &Path) {
    let mut output = Value::Object(std::mem::take(&mut result.output));
    externalize_value(&mut output, output_dir);
    if let Value::Object(map) = output {
        result.output = map;
    }

    externalize_flow_run(&mut result.run_info, output_dir);
    for node_run in result.node_run_infos.values_mut() {
        externalize_node_run(node_run, output_dir);
    }
}

fn externalize_flow_run(run_info: &mut FlowRunInfo, output_dir: &Path) {
    if let Some(inputs) = run_info.inputs.as_mut() {
        externalize_value(inputs, output_dir);
    }
    if let Some(output) = run_info.output.as_mut() {
        externalize_value(output, output_dir);
    }
}

fn externalize_node_run(run_info: &mut NodeRunInfo, output_dir: &Path) {
    if let Some(inputs) = run_info.inputs.as_mut() {
        externalize_value(inputs, output_dir);
    }
    if let Some(output) = run_info.output.as_mut() {
        externalize_value(output, output_dir);
    }
}

/// Recursively replace image payloads anywhere inside `value`.
pub fn externalize_value(value: &mut Value, output_dir: &Path) {
    match value {
        Value::Object(map) => {
            if let Some((mime, payload)) = as_inline_image(map) {
                match persist_payload(&mime, &payload, output_dir) {
                    Ok(file_name) => {
                        map.clear();
                        map.insert(format!("{mime}{PATH_SUFFIX}"), Value::String(file_name));
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to externalize image payload, keeping it inline");
                    }
                }
            } else {
                for nested in map.values_mut() {
                    externalize_value(nested, output_dir);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                externalize_value(item, output_dir);
            }
        }
        _ => {}
    }
}

/// Match the single-entry inline image shape and return `(mime, payload)`.
fn as_inline_image(map: &serde_json::Map<String, Value>) -> Option<(String, String)> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    let mime = key.strip_suffix(BASE64_SUFFIX)?;
    if !mime.starts_with(MIME_PREFIX) {
        return None;
    }
    let payload = value.as_str()?;
    Some((mime.to_string(), payload.to_string()))
}

fn persist_payload(mime: &str, payload: &str, output_dir: &Path) -> Result<String, MultimediaError> {
    let bytes = BASE64.decode(payload)?;
    let extension = mime.strip_prefix(MIME_PREFIX).unwrap_or("bin");
    let file_name = format!("{}.{extension}", Uuid::new_v4());
    std::fs::create_dir_all(output_dir)?;
    std::fs::write(output_dir.join(&file_name), bytes)?;
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inline_image() -> Value {
        json!({ "data:image/png;base64": BASE64.encode(b"not really a png") })
    }

    #[test]
    fn rewrites_nested_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = json!({
            "answer": "ok",
            "attachments": [inline_image(), {"caption": "x", "image": inline_image()}],
        });

        externalize_value(&mut value, dir.path());

        let first = &value["attachments"][0];
        let path = first["data:image/png;path"].as_str().unwrap();
        assert!(path.ends_with(".png"));
        assert!(dir.path().join(path).is_file());

        let nested = &value["attachments"][1]["image"];
        assert!(nested.get("data:image/png;path").is_some());
        assert_eq!(value["answer"], "ok");
    }

    #[test]
    fn leaves_non_image_objects_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = json!({
            "data:image/png;base64": 42,
            "base64": "not an image key",
            "two": {"data:image/png;base64": "x", "extra": true},
        });
        let before = value.clone();

        externalize_value(&mut value, dir.path());
        // Non-string payload, plain keys and multi-entry objects all stay as-is
        // (the bad base64 in "two" is not a single-entry image object).
        assert_eq!(value, before);
    }

    #[test]
    fn invalid_base64_is_kept_inline() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = json!({ "data:image/png;base64": "!!! not base64 !!!" });
        let before = value.clone();

        externalize_value(&mut value, dir.path());
        assert_eq!(value, before);
    }
}
