//! Batch pool execution tests: completeness, ordering, determinism and
//! concurrency of the happy paths.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{make_lines, CollectingStorage, EchoFactory, ScriptedBackend};
use lineflow::batch::{BatchError, BatchPoolConfig, LineExecutionPool};
use lineflow::contracts::{Mapping, Status, LINE_NUMBER_KEY};
use lineflow::executor::{FlowExecutorFactory, DEFAULT_NODE_CONCURRENCY};
use lineflow::storage::NoopRunStorage;
use lineflow::LineflowError;

fn scripted_pool(factory: Arc<EchoFactory>) -> LineExecutionPool {
    let backend = Arc::new(ScriptedBackend::new(factory));
    LineExecutionPool::new("echo", "run-1")
        .with_backend(backend)
        .with_config(
            BatchPoolConfig::default()
                .with_worker_count(3)
                .with_line_timeout(Duration::from_secs(30)),
        )
}

#[tokio::test]
async fn every_line_yields_exactly_one_result() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let lines = make_lines(&[0, 1, 2, 3, 4, 5, 6, 7], &[]);

    let results = pool.run(lines).await.expect("batch should succeed");

    assert_eq!(results.len(), 8);
    let indices: HashSet<u64> = results.iter().map(|r| r.run_info.index).collect();
    assert_eq!(indices, (0..8).collect());
    for result in &results {
        assert_eq!(result.run_info.status, Status::Completed);
        assert_eq!(result.output["echo"]["value"], json!(result.run_info.index));
        assert!(
            !result.output.contains_key(LINE_NUMBER_KEY),
            "reserved key must be scrubbed from line output"
        );
    }
}

#[tokio::test]
async fn non_contiguous_indices_are_preserved() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let lines = make_lines(&[5, 10, 42], &[]);

    let results = pool.run(lines).await.expect("batch should succeed");

    let indices: HashSet<u64> = results.iter().map(|r| r.run_info.index).collect();
    assert_eq!(indices, [5, 10, 42].into_iter().collect());
}

#[tokio::test]
async fn duplicate_indices_are_rejected() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let lines = make_lines(&[0, 1, 1], &[]);

    let err = pool.run(lines).await.expect_err("duplicates must fail");
    match err {
        LineflowError::Batch(BatchError::DuplicateLineIndex(index)) => assert_eq!(index, 1),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn empty_batch_returns_no_results() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let results = pool.run(Vec::new()).await.expect("empty batch is fine");
    assert!(results.is_empty());
}

#[tokio::test]
async fn pool_outputs_match_serial_execution() {
    let factory = Arc::new(EchoFactory::default());
    let pool = scripted_pool(factory.clone());
    let lines = make_lines(&[0, 1, 2, 3], &[]);

    let mut results = pool.run(lines.clone()).await.expect("batch should succeed");
    results.sort_by_key(|r| r.run_info.index);

    // The same lines, one at a time, straight through the executor.
    let mut serial = Vec::new();
    let mut executor = factory
        .create(Arc::new(NoopRunStorage))
        .await
        .expect("executor should build");
    for (index, inputs) in &lines {
        let mut result = executor
            .exec_line(inputs, "run-1", *index, None, true, DEFAULT_NODE_CONCURRENCY)
            .await
            .expect("serial execution should succeed");
        result.scrub_output();
        serial.push(result);
    }

    for (pooled, serial) in results.iter().zip(&serial) {
        assert_eq!(pooled.run_info.index, serial.run_info.index);
        assert_eq!(pooled.output, serial.output);
    }
}

#[tokio::test]
async fn two_lines_execute_concurrently() {
    let windows = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let factory = Arc::new(EchoFactory {
        windows: Some(windows.clone()),
    });
    let pool = scripted_pool(factory);
    let lines = make_lines(&[0, 1], &[("sleep_ms", json!(300))]);

    let results = pool.run(lines).await.expect("batch should succeed");
    assert_eq!(results.len(), 2);

    let windows = windows.lock();
    let (_, start_a, end_a) = windows[0];
    let (_, start_b, end_b) = windows[1];
    assert!(
        start_a < end_b && start_b < end_a,
        "execution windows must overlap with two free slots"
    );
}

#[tokio::test]
async fn failed_lines_are_absorbed_into_results() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let mut lines = make_lines(&[0, 2], &[]);
    let mut failing = Mapping::new();
    failing.insert("value".into(), json!(1));
    failing.insert("fail".into(), json!(true));
    lines.push((1, failing));

    let mut results = pool.run(lines).await.expect("tool failures never fail the run");
    results.sort_by_key(|r| r.run_info.index);

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].run_info.status, Status::Completed);
    assert_eq!(results[1].run_info.status, Status::Failed);
    assert!(results[1].output.is_empty(), "failed lines carry no output");
    assert_eq!(results[2].run_info.status, Status::Completed);

    let error = results[1].run_info.error.as_ref().expect("failure recorded");
    assert_eq!(error["error_type"], "ToolError");
}

#[tokio::test]
async fn executor_escapes_become_failed_results() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));
    let lines = make_lines(&[3], &[("explode", json!(true))]);

    let results = pool.run(lines).await.expect("executor escapes never fail the run");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].run_info.status, Status::Failed);
    let error = results[0].run_info.error.as_ref().expect("failure recorded");
    assert_eq!(error["error_type"], "ExecutorError");
}

#[tokio::test]
async fn streamed_records_reach_the_real_sink() {
    let storage = Arc::new(CollectingStorage::default());
    let factory = Arc::new(EchoFactory::default());
    let backend = Arc::new(ScriptedBackend::new(factory));
    let pool = LineExecutionPool::new("echo", "run-1")
        .with_backend(backend)
        .with_storage(storage.clone())
        .with_config(BatchPoolConfig::default().with_worker_count(2));

    let results = pool.run(make_lines(&[0, 1, 2], &[])).await.unwrap();
    assert_eq!(results.len(), 3);

    // One node record and one flow record per line were streamed out of the
    // workers and forwarded to the sink.
    assert_eq!(storage.node_runs.lock().len(), 3);
    assert_eq!(storage.flow_runs.lock().len(), 3);
}

#[tokio::test]
async fn rerunning_the_pool_does_not_leak_state() {
    let pool = scripted_pool(Arc::new(EchoFactory::default()));

    let first = pool.run(make_lines(&[0, 1, 2, 3, 4], &[])).await.unwrap();
    assert_eq!(first.len(), 5);

    let second = pool.run(make_lines(&[100, 101], &[])).await.unwrap();
    assert_eq!(second.len(), 2);
    let indices: HashSet<u64> = second.iter().map(|r| r.run_info.index).collect();
    assert_eq!(indices, [100, 101].into_iter().collect());
}
