#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kopa_core::{BackoffPolicy, ResourceDescriptor};
use kopa_opa::mock::{Call, MockClient};
use kopa_sync::testing::StaticWatchSource;
use kopa_sync::GenericSync;

fn nodes_descriptor() -> ResourceDescriptor {
    ResourceDescriptor::new("", "v1", "nodes", false)
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        min: Duration::from_millis(10),
        max: Duration::from_millis(40),
        jitter: 0.0,
    }
}

fn node(name: &str, version: &str) -> Value {
    json!({"metadata": {"name": name, "resourceVersion": version}})
}

/// Spawn an engine over the given source/mock and return its pieces.
fn start(
    descriptor: ResourceDescriptor,
    mock: &MockClient,
    source: &StaticWatchSource,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<Result<(), kopa_sync::SyncError>>,
) {
    let engine = GenericSync::new(descriptor, mock, fast_backoff(), Vec::new());
    let token = CancellationToken::new();
    let task = {
        let source = source.clone();
        let token = token.clone();
        tokio::spawn(async move { engine.run(&source, token).await })
    };
    (token, task)
}

/// Poll until `cond` holds over the recorded calls.
async fn wait_for_calls<F>(mock: &MockClient, cond: F) -> Vec<Call>
where
    F: Fn(&[Call]) -> bool,
{
    for _ in 0..300 {
        let calls = mock.calls();
        if cond(&calls) {
            return calls;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met; calls: {:?}", mock.calls());
}

#[tokio::test]
async fn startup_update_delete_scenario() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    source.seed("node1", "1", node("node1", "1"));
    let (token, task) = start(nodes_descriptor(), &mock, &source);

    // Startup: one reload with the whole (flat) payload.
    wait_for_calls(&mock, |calls| !calls.is_empty()).await;
    assert_eq!(
        mock.calls()[0],
        Call::PutData {
            path: "nodes".to_string(),
            value: json!({"node1": node("node1", "1")}),
        }
    );

    // Update with a new version token: one single-key replace.
    source.apply("node1", "2", node("node1", "2"));
    wait_for_calls(&mock, |calls| {
        calls.contains(&Call::PutData {
            path: "nodes/node1".to_string(),
            value: node("node1", "2"),
        })
    })
    .await;

    // Delete: exactly one remove patch at the key's path.
    source.delete("node1");
    let calls = wait_for_calls(&mock, |calls| {
        calls.contains(&Call::PatchData {
            path: "nodes/node1".to_string(),
            op: "remove".to_string(),
        })
    })
    .await;

    // The remove succeeded, so no recovery reload follows it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.calls().len(), calls.len());

    token.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn namespaced_reload_groups_by_namespace() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    source.seed("ns1/pod1", "1", node("pod1", "1"));
    source.seed("ns1/pod2", "1", node("pod2", "1"));
    source.seed("ns2/pod1", "1", node("pod1", "1"));
    let descriptor = ResourceDescriptor::new("", "v1", "pods", true);
    let (token, task) = start(descriptor, &mock, &source);

    wait_for_calls(&mock, |calls| !calls.is_empty()).await;
    assert_eq!(
        mock.calls()[0],
        Call::PutData {
            path: "pods".to_string(),
            value: json!({
                "ns1": {"pod1": node("pod1", "1"), "pod2": node("pod2", "1")},
                "ns2": {"pod1": node("pod1", "1")},
            }),
        }
    );

    token.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn unchanged_version_produces_no_calls() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    source.seed("node1", "1", node("node1", "1"));
    let (token, task) = start(nodes_descriptor(), &mock, &source);

    wait_for_calls(&mock, |calls| !calls.is_empty()).await;

    // Relist echo: same change-version token.
    source.apply("node1", "1", node("node1", "1"));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(mock.calls().len(), 1, "echo must not reach the writer");

    token.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn write_failure_abandons_round_and_reloads() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    source.seed("node1", "1", node("node1", "1"));
    let (token, task) = start(nodes_descriptor(), &mock, &source);

    wait_for_calls(&mock, |calls| !calls.is_empty()).await;

    mock.fail("put", "nodes/node1", 1);
    source.apply("node1", "2", node("node1", "2"));
    source.apply("node2", "1", node("node2", "1"));

    // The failed write is followed by a reload projecting the freshest
    // mirror state.
    let calls = wait_for_calls(&mock, |calls| {
        calls.iter().filter(|c| matches!(c, Call::PutData { path, .. } if path == "nodes")).count() >= 2
    })
    .await;
    let failed_at = calls
        .iter()
        .position(|c| matches!(c, Call::PutData { path, .. } if path == "nodes/node1"))
        .expect("failed key write recorded");
    match &calls[failed_at + 1] {
        Call::PutData { path, value } => {
            assert_eq!(path, "nodes", "next write after a failure must be the reload");
            assert_eq!(value["node1"], node("node1", "2"));
        }
        other => panic!("expected reload after failure, got {:?}", other),
    }
    // Writes for the other key of the abandoned round never jump the reload.
    let reload_at = failed_at + 1;
    assert!(!calls[..=reload_at]
        .iter()
        .any(|c| matches!(c, Call::PutData { path, .. } if path == "nodes/node2")));

    token.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn failed_remove_triggers_reload() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    source.seed("node1", "1", node("node1", "1"));
    source.seed("node2", "1", node("node2", "1"));
    let (token, task) = start(nodes_descriptor(), &mock, &source);

    wait_for_calls(&mock, |calls| !calls.is_empty()).await;

    mock.fail("patch", "nodes/node1", 1);
    source.delete("node1");

    let calls = wait_for_calls(&mock, |calls| {
        calls.iter().filter(|c| matches!(c, Call::PutData { path, .. } if path == "nodes")).count() >= 2
    })
    .await;
    let patch_at = calls
        .iter()
        .position(|c| matches!(c, Call::PatchData { path, .. } if path == "nodes/node1"))
        .expect("remove patch recorded");
    assert_eq!(
        calls[patch_at + 1],
        Call::PutData {
            path: "nodes".to_string(),
            value: json!({"node2": node("node2", "1")}),
        }
    );

    token.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn setup_failure_is_fatal_to_run() {
    let mock = MockClient::new();
    let source = StaticWatchSource::failing("connection refused");
    let engine = GenericSync::new(nodes_descriptor(), &mock, fast_backoff(), Vec::new());
    let err = engine
        .run(&source, CancellationToken::new())
        .await
        .expect_err("setup failure must propagate");
    assert!(err.to_string().contains("watch setup"));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn loaded_flag_sets_after_first_reload() {
    let mock = MockClient::new();
    let source = StaticWatchSource::new();
    let engine = GenericSync::new(nodes_descriptor(), &mock, fast_backoff(), Vec::new());
    let loaded = engine.loaded_flag();
    assert!(!engine.ready());
    let token = CancellationToken::new();
    let task = {
        let source = source.clone();
        let token = token.clone();
        tokio::spawn(async move { engine.run(&source, token).await })
    };
    wait_for_calls(&mock, |calls| !calls.is_empty()).await;
    assert!(loaded.load(std::sync::atomic::Ordering::SeqCst));
    token.cancel();
    assert!(task.await.unwrap().is_ok());
}
