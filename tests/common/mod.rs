//! Shared test doubles: an in-memory permission service and a scripted
//! upstream Kubernetes transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use graphguard::spicedb::{
    CheckRequest, Decision, LookupRequest, PermissionClient, Precondition, PreconditionOp,
    Relationship, RelationshipFilter, RelationshipOp, RelationshipUpdate,
    RelationshipUpdateStream, ResourceIdStream, SpiceDbError,
};
use graphguard::workflow::activities::KubeClient;
use graphguard::workflow::{ActivityError, KubeRequest, KubeResponse, KubeStatus, KubeStatusDetails};

/// In-memory permission service. Relationships live in a set; writes honor
/// preconditions transactionally; checks and lookups answer from configured
/// tables.
#[derive(Default)]
pub struct FakeSpiceDb {
    relationships: Mutex<HashSet<Relationship>>,
    /// Checks that return HAS_PERMISSION, keyed by the rendered tuple form.
    allowed_checks: Mutex<HashSet<String>>,
    /// LookupResources results keyed by resource type.
    lookups: Mutex<HashMap<String, Vec<String>>>,
    /// Watch stream handed out on the first watch call.
    watch_stream: Mutex<Option<RelationshipUpdateStream>>,
    /// Number of upcoming writes to fail with a transport error.
    fail_next_writes: AtomicUsize,
    pub check_count: AtomicUsize,
    pub write_count: AtomicUsize,
    pub lookup_count: AtomicUsize,
}

impl FakeSpiceDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_check(&self, check: &str) {
        self.allowed_checks.lock().unwrap().insert(check.to_string());
    }

    pub fn set_lookup(&self, resource_type: &str, ids: &[&str]) {
        self.lookups.lock().unwrap().insert(
            resource_type.to_string(),
            ids.iter().map(|s| (*s).to_string()).collect(),
        );
    }

    pub fn set_watch_stream(&self, stream: RelationshipUpdateStream) {
        *self.watch_stream.lock().unwrap() = Some(stream);
    }

    pub fn fail_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn insert(&self, rel: Relationship) {
        self.relationships.lock().unwrap().insert(rel);
    }

    /// Snapshot of the rendered tuples currently stored.
    pub fn tuples(&self) -> Vec<String> {
        let mut tuples: Vec<String> = self
            .relationships
            .lock()
            .unwrap()
            .iter()
            .map(Relationship::to_string)
            .collect();
        tuples.sort();
        tuples
    }

    pub fn has(&self, tuple: &str) -> bool {
        self.tuples().iter().any(|t| t == tuple)
    }

    pub fn lock_count(&self) -> usize {
        self.relationships
            .lock()
            .unwrap()
            .iter()
            .filter(|rel| rel.resource_type == "lock")
            .count()
    }
}

fn check_key(req: &CheckRequest) -> String {
    format!(
        "{}:{}#{}@{}:{}",
        req.resource_type, req.resource_id, req.permission, req.subject_type, req.subject_id
    )
}

#[async_trait]
impl PermissionClient for FakeSpiceDb {
    async fn check_permission(&self, req: &CheckRequest) -> Result<Decision, SpiceDbError> {
        self.check_count.fetch_add(1, Ordering::SeqCst);
        if self.allowed_checks.lock().unwrap().contains(&check_key(req)) {
            Ok(Decision::HasPermission)
        } else {
            Ok(Decision::NoPermission)
        }
    }

    async fn lookup_resources(&self, req: &LookupRequest) -> Result<ResourceIdStream, SpiceDbError> {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        let ids = self
            .lookups
            .lock()
            .unwrap()
            .get(&req.resource_type)
            .cloned()
            .unwrap_or_default();
        Ok(futures::stream::iter(ids.into_iter().map(Ok)).boxed())
    }

    async fn watch_relationships(
        &self,
        _object_types: Vec<String>,
    ) -> Result<RelationshipUpdateStream, SpiceDbError> {
        match self.watch_stream.lock().unwrap().take() {
            Some(stream) => Ok(stream),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>, SpiceDbError> {
        Ok(self
            .relationships
            .lock()
            .unwrap()
            .iter()
            .filter(|rel| filter.matches(rel))
            .cloned()
            .collect())
    }

    async fn write_relationships(
        &self,
        preconditions: Vec<Precondition>,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<(), SpiceDbError> {
        if self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpiceDbError::Unavailable("injected write failure".into()));
        }

        let mut relationships = self.relationships.lock().unwrap();
        for precondition in &preconditions {
            let matched = relationships
                .iter()
                .any(|rel| precondition.filter.matches(rel));
            let satisfied = match precondition.operation {
                PreconditionOp::MustMatch => matched,
                PreconditionOp::MustNotMatch => !matched,
            };
            if !satisfied {
                return Err(SpiceDbError::PreconditionFailed(format!(
                    "precondition on {} failed",
                    precondition.filter.resource_type
                )));
            }
        }

        // All-or-nothing: validate creates before applying anything.
        for update in &updates {
            if update.operation == RelationshipOp::Create
                && relationships.contains(&update.relationship)
            {
                return Err(SpiceDbError::InvalidArgument(format!(
                    "relationship already exists: {}",
                    update.relationship
                )));
            }
        }
        for update in &updates {
            match update.operation {
                RelationshipOp::Create | RelationshipOp::Touch => {
                    relationships.insert(update.relationship.clone());
                }
                RelationshipOp::Delete => {
                    relationships.remove(&update.relationship);
                }
            }
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted upstream transport: each call pops the next scripted outcome.
pub struct FakeKube {
    responses: Mutex<VecDeque<Result<KubeResponse, ActivityError>>>,
    exists_responses: Mutex<VecDeque<Result<bool, ActivityError>>>,
    /// Artificial latency per call, for interleaving tests.
    pub delay: Duration,
    pub call_count: AtomicUsize,
}

impl Default for FakeKube {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            exists_responses: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            call_count: AtomicUsize::new(0),
        }
    }
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push_status(&self, status: u16) {
        self.responses.lock().unwrap().push_back(Ok(response(status)));
    }

    pub fn push_retry_after(&self, status: u16, seconds: u64) {
        let mut resp = response(status);
        resp.err_status = Some(KubeStatus {
            kind: "Status".into(),
            code: status,
            details: Some(KubeStatusDetails {
                retry_after_seconds: seconds,
                ..Default::default()
            }),
            ..Default::default()
        });
        self.responses.lock().unwrap().push_back(Ok(resp));
    }

    pub fn push_transport_error(&self) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(ActivityError::Unavailable("connection refused".into())));
    }

    pub fn push_exists(&self, exists: bool) {
        self.exists_responses.lock().unwrap().push_back(Ok(exists));
    }
}

pub fn response(status: u16) -> KubeResponse {
    KubeResponse {
        status,
        headers: vec![("content-type".into(), "application/json".into())],
        body: format!("{{\"code\":{status}}}").into_bytes(),
        err_status: None,
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn execute(&self, _req: &KubeRequest) -> Result<KubeResponse, ActivityError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(response(200)))
    }

    async fn resource_exists(&self, _path: &str) -> Result<bool, ActivityError> {
        self.exists_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(false))
    }
}

/// A pod-creation relationship used across the workflow scenarios.
pub fn owner_relationship() -> Relationship {
    Relationship {
        resource_type: "pod".into(),
        resource_id: "test".into(),
        relation: "owner".into(),
        subject_type: "user".into(),
        subject_id: "alice".into(),
        subject_relation: None,
    }
}
