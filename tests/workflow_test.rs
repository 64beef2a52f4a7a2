//! Dual-write workflow scenarios against in-memory backends.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{owner_relationship, FakeKube, FakeSpiceDb};
use graphguard::authz::{RequestDescriptor, UserInfo};
use graphguard::rules::LockMode;
use graphguard::spicedb::PermissionClient;
use graphguard::workflow::activities::KubeClient;
use graphguard::workflow::{
    ActivityHandler, HistoryStore, KubeRequest, WorkflowEngine, WorkflowError, WriteInput,
};

const OWNER_TUPLE: &str = "pod:test#owner@user:alice";

fn engine_with(
    store: HistoryStore,
    spicedb: &Arc<FakeSpiceDb>,
    kube: &Arc<FakeKube>,
) -> WorkflowEngine {
    let activities = ActivityHandler::new(
        spicedb.clone() as Arc<dyn PermissionClient>,
        kube.clone() as Arc<dyn KubeClient>,
    );
    WorkflowEngine::new(store, activities).with_timeout(Duration::from_secs(30))
}

fn engine(spicedb: &Arc<FakeSpiceDb>, kube: &Arc<FakeKube>) -> WorkflowEngine {
    engine_with(HistoryStore::open("").unwrap(), spicedb, kube)
}

fn create_input() -> WriteInput {
    WriteInput {
        request: RequestDescriptor {
            verb: "create".into(),
            api_group: String::new(),
            api_version: "v1".into(),
            resource: "pods".into(),
            subresource: String::new(),
            name: String::new(),
            namespace: "default".into(),
            path: "/api/v1/namespaces/default/pods".into(),
        },
        user: UserInfo {
            name: "alice".into(),
            ..Default::default()
        },
        object_name: "test".into(),
        kube_request: KubeRequest {
            method: "POST".into(),
            path_and_query: "/api/v1/namespaces/default/pods".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: br#"{"metadata":{"name":"test"}}"#.to_vec(),
        },
        preconditions: vec![],
        creates: vec![owner_relationship()],
        touches: vec![],
        deletes: vec![],
        delete_by_filter: vec![],
    }
}

#[tokio::test]
async fn test_pessimistic_create_success() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(201);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 201);
    assert!(spicedb.has(OWNER_TUPLE), "relationship must be committed");
    assert_eq!(spicedb.lock_count(), 0, "no lock may survive the workflow");
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pessimistic_retries_server_error_with_backoff() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(500);
    kube.push_status(201);

    let engine = engine(&spicedb, &kube);
    let started = Instant::now();
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(resp.status, 201);
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 2);
    // Exactly one backoff step: base 100ms, jitter at most 10%, so the
    // sleep lands in [100ms, 110ms]; the ceiling allows scheduling slack.
    assert!(elapsed >= Duration::from_millis(100), "backoff was skipped: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(250), "backoff too long: {elapsed:?}");

    // Exactly one committed relationship, no duplicate from the retry.
    assert_eq!(spicedb.tuples(), vec![OWNER_TUPLE.to_string()]);
    assert_eq!(spicedb.lock_count(), 0);
}

#[tokio::test]
async fn test_pessimistic_conflict_on_create_counts_as_success() {
    // A 409 from the upstream means an earlier attempt already created the
    // object; the relationships must stand.
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(409);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 409);
    assert!(spicedb.has(OWNER_TUPLE));
    assert_eq!(spicedb.lock_count(), 0);
}

#[tokio::test]
async fn test_pessimistic_terminal_failure_rolls_back_everything() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(403);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();

    // The upstream response is returned verbatim, but nothing survives in
    // the permission service.
    assert_eq!(resp.status, 403);
    assert!(spicedb.tuples().is_empty());
    assert_eq!(spicedb.lock_count(), 0);
}

#[tokio::test]
async fn test_pessimistic_spicedb_failure_reports_conflict() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    spicedb.fail_writes(1);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 409);
    let body = String::from_utf8(resp.body).unwrap();
    assert!(body.contains("\"reason\":\"Conflict\""), "body: {body}");
    // Nothing reached the upstream and nothing was committed.
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 0);
    assert!(spicedb.tuples().is_empty());
}

#[tokio::test]
async fn test_pessimistic_retry_after_is_honored() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_retry_after(429, 1);
    kube.push_status(201);

    let engine = engine(&spicedb, &kube);
    let started = Instant::now();
    let resp = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 201);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pessimistic_lock_excludes_concurrent_writers() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::with_delay(Duration::from_millis(100)));
    kube.push_status(201);
    kube.push_status(201);

    let engine = engine(&spicedb, &kube);
    let (a, b) = tokio::join!(
        engine.dispatch(LockMode::Pessimistic, create_input()),
        engine.dispatch(LockMode::Pessimistic, create_input()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut statuses = [a.status, b.status];
    statuses.sort();
    assert_eq!(statuses, [201, 409], "exactly one writer wins the lock");
    assert!(spicedb.has(OWNER_TUPLE));
    assert_eq!(spicedb.lock_count(), 0);
}

#[tokio::test]
async fn test_optimistic_create_success() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(201);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Optimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 201);
    assert!(spicedb.has(OWNER_TUPLE));
    assert_eq!(spicedb.lock_count(), 0, "optimistic writes never take locks");
}

#[tokio::test]
async fn test_optimistic_ghost_success_retains_relationships() {
    // The kube activity fails, but the object exists upstream anyway: the
    // relationship write must stand and the error goes to the client.
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_transport_error();
    kube.push_exists(true);

    let engine = engine(&spicedb, &kube);
    let err = engine
        .dispatch(LockMode::Optimistic, create_input())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UpstreamUnreachable(_)));
    assert!(spicedb.has(OWNER_TUPLE), "ghost-successful write must be kept");
}

#[tokio::test]
async fn test_optimistic_rolls_back_when_object_missing() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_transport_error();
    kube.push_exists(false);

    let engine = engine(&spicedb, &kube);
    let err = engine
        .dispatch(LockMode::Optimistic, create_input())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UpstreamUnreachable(_)));
    assert!(spicedb.tuples().is_empty(), "failed write must be rolled back");
}

#[tokio::test]
async fn test_optimistic_spicedb_failure_reports_conflict() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    spicedb.fail_writes(1);

    let engine = engine(&spicedb, &kube);
    let resp = engine
        .dispatch(LockMode::Optimistic, create_input())
        .await
        .unwrap();

    assert_eq!(resp.status, 409);
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resume_replays_completed_activities() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflows.db");
    let path = path.to_str().unwrap();

    // A previous process wrote to the permission service (recorded at seq 0)
    // and crashed before the upstream write.
    let store = HistoryStore::open(path).unwrap();
    let input = serde_json::to_string(&create_input()).unwrap();
    store
        .create_instance("wf-replay", "pessimistic-dual-write", &input)
        .unwrap();
    store
        .record_event("wf-replay", 0, "write_to_spicedb", r#"{"ok":null}"#)
        .unwrap();

    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(201);

    let engine = engine_with(HistoryStore::open(path).unwrap(), &spicedb, &kube);
    assert_eq!(engine.resume_pending().await, 1);

    // The recorded write is replayed, not re-executed: the only live write
    // is the lock removal during cleanup.
    assert_eq!(spicedb.write_count.load(Ordering::SeqCst), 1);
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.instance_status("wf-replay").unwrap().as_deref(),
        Some("completed")
    );
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_roll_back() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    for _ in 0..5 {
        kube.push_transport_error();
    }

    let engine = engine(&spicedb, &kube);
    let err = engine
        .dispatch(LockMode::Pessimistic, create_input())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UpstreamUnreachable(_)));
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 5);
    assert!(spicedb.tuples().is_empty());
    assert_eq!(spicedb.lock_count(), 0);
}
