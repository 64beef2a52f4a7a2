//! Authorization pipeline scenarios: matching, conditions, checks and
//! update dispatch, driven through the public `Authorizer` surface.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{FakeKube, FakeSpiceDb};
use graphguard::authz::{
    Authorized, Authorizer, AuthzError, AuthzInput, NamespacedName, RequestDescriptor, UserInfo,
};
use graphguard::rules::{self, LockMode, RuleMatcher};
use graphguard::spicedb::PermissionClient;
use graphguard::workflow::activities::KubeClient;
use graphguard::workflow::{ActivityHandler, HistoryStore, WorkflowEngine};

fn authorizer(yaml: &str, spicedb: &Arc<FakeSpiceDb>, kube: &Arc<FakeKube>) -> Authorizer {
    let compiled = rules::parse(yaml)
        .unwrap()
        .into_iter()
        .map(|config| rules::compile(config).unwrap())
        .collect();
    let engine = WorkflowEngine::new(
        HistoryStore::open("").unwrap(),
        ActivityHandler::new(
            spicedb.clone() as Arc<dyn PermissionClient>,
            kube.clone() as Arc<dyn KubeClient>,
        ),
    );
    Authorizer::new(
        RuleMatcher::new(compiled),
        spicedb.clone() as Arc<dyn PermissionClient>,
        engine,
        LockMode::Pessimistic,
    )
}

fn input(method: &str, path: &str, query: Option<&str>, user: &str, body: &[u8]) -> AuthzInput {
    let descriptor = RequestDescriptor::parse(method, path, query).unwrap();
    AuthzInput::new(
        descriptor,
        UserInfo {
            name: user.into(),
            groups: vec!["dev".into()],
            ..Default::default()
        },
        BTreeMap::new(),
        query.map(str::to_string),
        body.to_vec(),
    )
}

const GET_POD_RULE: &str = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["get"]
check:
- tpl: "pod:{{name}}#view@user:{{user.name}}"
"#;

#[tokio::test]
async fn test_unmatched_request_denied_without_rpcs() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(GET_POD_RULE, &spicedb, &kube);

    let err = authz
        .authorize(&input("GET", "/api/v1/secrets", None, "alice", b""))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthzError::NoMatch));
    assert_eq!(err.status_code(), 401);
    // Denial is decided locally: no permission service traffic at all.
    assert_eq!(spicedb.check_count.load(Ordering::SeqCst), 0);
    assert_eq!(spicedb.lookup_count.load(Ordering::SeqCst), 0);
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_check_denial_blocks_request() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(GET_POD_RULE, &spicedb, &kube);

    let err = authz
        .authorize(&input(
            "GET",
            "/api/v1/namespaces/default/pods/test",
            None,
            "alice",
            b"",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthzError::PermissionDenied));
    assert_eq!(err.status_code(), 403);
    assert_eq!(spicedb.check_count.load(Ordering::SeqCst), 1);
    // No workflow may be dispatched on a denial.
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_checked_get_is_admitted_without_prefilters() {
    let spicedb = Arc::new(FakeSpiceDb::new());
    spicedb.allow_check("pod:test#view@user:alice");
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(GET_POD_RULE, &spicedb, &kube);

    let outcome = authz
        .authorize(&input(
            "GET",
            "/api/v1/namespaces/default/pods/test",
            None,
            "alice",
            b"",
        ))
        .await
        .unwrap();

    let Authorized::Filtered(mut data) = outcome else {
        panic!("expected filter path for a get request");
    };
    let identity = NamespacedName {
        namespace: "default".into(),
        name: "test".into(),
    };
    assert!(data.allow_single(&identity).await);
}

#[tokio::test]
async fn test_conditions_filter_rules() {
    let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["get"]
if:
- "user.name == 'bob'"
"#;
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(yaml, &spicedb, &kube);

    let err = authz
        .authorize(&input(
            "GET",
            "/api/v1/namespaces/default/pods/test",
            None,
            "alice",
            b"",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthzError::ConditionsUnmet));
}

#[tokio::test]
async fn test_non_boolean_condition_is_template_error() {
    let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["get"]
if:
- "user.name"
"#;
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(yaml, &spicedb, &kube);

    let err = authz
        .authorize(&input(
            "GET",
            "/api/v1/namespaces/default/pods/test",
            None,
            "alice",
            b"",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthzError::Template(_)));
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn test_ambiguous_update_rules_rejected() {
    let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["create"]
update:
  creates:
  - tpl: "pod:{{namespacedName}}#owner@user:{{user.name}}"
---
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["create"]
update:
  touches:
  - tpl: "namespace:{{resourceNamespace}}#member@user:{{user.name}}"
"#;
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    let authz = authorizer(yaml, &spicedb, &kube);

    let err = authz
        .authorize(&input(
            "POST",
            "/api/v1/namespaces/default/pods",
            None,
            "alice",
            br#"{"metadata":{"name":"test","namespace":"default"}}"#,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthzError::AmbiguousUpdate));
    assert_eq!(err.status_code(), 500);
    assert_eq!(kube.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_update_rule_dispatches_workflow() {
    let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
lock: Pessimistic
match:
- apiVersion: v1
  resource: pods
  verbs: ["create"]
update:
  creates:
  - tpl: "pod:{{name}}#owner@user:{{user.name}}"
"#;
    let spicedb = Arc::new(FakeSpiceDb::new());
    let kube = Arc::new(FakeKube::new());
    kube.push_status(201);
    let authz = authorizer(yaml, &spicedb, &kube);

    let outcome = authz
        .authorize(&input(
            "POST",
            "/api/v1/namespaces/default/pods",
            None,
            "alice",
            br#"{"metadata":{"name":"test","namespace":"default"}}"#,
        ))
        .await
        .unwrap();

    let Authorized::Write(resp) = outcome else {
        panic!("expected a dual write");
    };
    assert_eq!(resp.status, 201);
    assert!(spicedb.has("pod:test#owner@user:alice"));
    assert_eq!(spicedb.lock_count(), 0);
}
