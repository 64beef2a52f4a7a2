//! The Optimistic and Pessimistic dual-write orchestrations.
//!
//! Both materialize the rule's relationship updates, write them to the
//! permission service, then perform the upstream Kubernetes write. They
//! differ in how concurrent writers are handled: Pessimistic serializes
//! writers to the same `(path, name, verb)` key with a lock relationship
//! and a MUST_NOT_MATCH precondition; Optimistic writes immediately and
//! reports any permission-service failure as a Kubernetes conflict so the
//! client retries.

use std::hash::Hasher;
use std::time::Duration;

use tracing::{error, warn};
use twox_hash::XxHash64;

use crate::spicedb::{
    Precondition, PreconditionOp, Relationship, RelationshipFilter, RelationshipOp,
    RelationshipUpdate, SubjectFilter,
};

use super::activities::{
    ExistsProbe, WriteRelationshipsInput, CHECK_KUBE_RESOURCE, READ_RELATIONSHIPS,
    WRITE_TO_KUBE, WRITE_TO_SPICEDB,
};
use super::engine::WorkflowCtx;
use super::{
    ActivityError, KubeResponse, KubeStatus, KubeStatusDetails, WorkflowError, WriteInput,
    MAX_KUBE_ATTEMPTS,
};

const LOCK_RESOURCE_TYPE: &str = "lock";
const LOCK_RELATION: &str = "workflow";
const WORKFLOW_SUBJECT_TYPE: &str = "workflow";

const KUBE_BACKOFF_BASE_MS: u64 = 100;
const KUBE_BACKOFF_JITTER: f64 = 0.1;
const ROLLBACK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Ensures a write lands in both the permission service and Kubernetes, or
/// in neither, serializing concurrent writers with a lock relationship.
pub async fn pessimistic_write(
    ctx: &mut WorkflowCtx,
    input: &WriteInput,
) -> Result<KubeResponse, WorkflowError> {
    let lock = RelationshipUpdate::new(
        RelationshipOp::Create,
        lock_relationship(input, ctx.instance_id()),
    );

    let updates = match materialize_updates(ctx, input).await {
        Ok(updates) => updates,
        // Nothing has been written yet; surface the failure as a conflict so
        // the client retries instead of the workflow.
        Err(err) => return Ok(kube_conflict(&err.to_string(), input)),
    };

    let mut preconditions = vec![lock_does_not_exist(&lock.relationship)];
    preconditions.extend(input.preconditions.iter().cloned());

    let mut write_updates = updates.clone();
    write_updates.push(lock.clone());
    let write = WriteRelationshipsInput {
        preconditions,
        updates: write_updates,
    };
    if let Err(err) = ctx.activity::<_, ()>(WRITE_TO_SPICEDB, &write).await {
        // The transactional write failed, so neither the updates nor the
        // lock exist; there is nothing to roll back.
        warn!(instance = %ctx.instance_id(), error = %err, "relationship write failed");
        return Ok(kube_conflict(&err.to_string(), input));
    }

    let rollback = Rollback::new(vec![lock.clone()]);
    let mut attempt = 0u32;
    loop {
        match ctx
            .activity::<_, KubeResponse>(WRITE_TO_KUBE, &input.kube_request)
            .await
        {
            Err(err) => {
                attempt += 1;
                if attempt >= MAX_KUBE_ATTEMPTS {
                    break;
                }
                warn!(instance = %ctx.instance_id(), error = %err, attempt, "upstream write failed; retrying");
                let delay = backoff_delay(ctx.instance_id(), attempt - 1);
                ctx.sleep(delay).await;
            }
            Ok(resp) => {
                // A server-requested delay does not count against attempts.
                if let Some(secs) = resp.retry_after_seconds() {
                    ctx.sleep(Duration::from_secs(secs)).await;
                    continue;
                }
                if resp.status >= 500 {
                    attempt += 1;
                    if attempt >= MAX_KUBE_ATTEMPTS {
                        break;
                    }
                    warn!(instance = %ctx.instance_id(), status = resp.status, attempt, "upstream error status; retrying");
                    let delay = backoff_delay(ctx.instance_id(), attempt - 1);
                    ctx.sleep(delay).await;
                    continue;
                }
                if is_successful_write(&input.request.verb, resp.status) {
                    rollback.cleanup(ctx).await;
                    return Ok(resp);
                }
                // Terminal upstream failure: remove the user updates along
                // with the lock.
                warn!(instance = %ctx.instance_id(), status = resp.status, "unsuccessful upstream write; rolling back");
                rollback.and(&updates).cleanup(ctx).await;
                return Ok(resp);
            }
        }
    }

    rollback.and(&updates).cleanup(ctx).await;
    Err(WorkflowError::UpstreamUnreachable(format!(
        "failed to communicate with kubernetes after {MAX_KUBE_ATTEMPTS} attempts"
    )))
}

/// Ensures a write lands in both the permission service and Kubernetes, or
/// in neither, by attempting the writes and rolling back on failure.
/// Conflicting writers are left to retry.
pub async fn optimistic_write(
    ctx: &mut WorkflowCtx,
    input: &WriteInput,
) -> Result<KubeResponse, WorkflowError> {
    let updates = match materialize_updates(ctx, input).await {
        Ok(updates) => updates,
        Err(err) => return Ok(kube_conflict(&err.to_string(), input)),
    };

    let write = WriteRelationshipsInput {
        preconditions: Vec::new(),
        updates: updates.clone(),
    };
    if let Err(err) = ctx.activity::<_, ()>(WRITE_TO_SPICEDB, &write).await {
        // Nothing was written; report the failure as a conflict.
        warn!(instance = %ctx.instance_id(), error = %err, "relationship write failed");
        return Ok(kube_conflict(&err.to_string(), input));
    }

    let rollback = Rollback::new(updates);
    match ctx
        .activity::<_, KubeResponse>(WRITE_TO_KUBE, &input.kube_request)
        .await
    {
        Ok(resp) => Ok(resp),
        Err(err) => {
            // The activity failed, but the write may still have reached the
            // API server. Keep the relationships when the object exists.
            let probe = ExistsProbe {
                path: probe_path(input),
            };
            let exists: bool = ctx
                .activity(CHECK_KUBE_RESOURCE, &probe)
                .await
                .map_err(|e| WorkflowError::UpstreamUnreachable(e.to_string()))?;
            if !exists {
                rollback.cleanup(ctx).await;
            }
            Err(WorkflowError::UpstreamUnreachable(err.to_string()))
        }
    }
}

/// Expand the rule's update block into concrete relationship updates.
/// Delete-by-filter sets are read through an activity so replays observe
/// the same expansion.
async fn materialize_updates(
    ctx: &mut WorkflowCtx,
    input: &WriteInput,
) -> Result<Vec<RelationshipUpdate>, ActivityError> {
    let mut updates = Vec::new();
    for rel in &input.creates {
        updates.push(RelationshipUpdate::new(RelationshipOp::Create, rel.clone()));
    }
    for rel in &input.touches {
        updates.push(RelationshipUpdate::new(RelationshipOp::Touch, rel.clone()));
    }
    for rel in &input.deletes {
        updates.push(RelationshipUpdate::new(RelationshipOp::Delete, rel.clone()));
    }
    for filter in &input.delete_by_filter {
        let matched: Vec<Relationship> = ctx.activity(READ_RELATIONSHIPS, filter).await?;
        for rel in matched {
            updates.push(RelationshipUpdate::new(RelationshipOp::Delete, rel));
        }
    }
    Ok(updates)
}

/// Relationship updates to undo when a workflow unwinds. Rollback writes are
/// best-effort and retried until they stick, except on invalid-argument
/// errors, which cannot succeed on retry.
struct Rollback {
    updates: Vec<RelationshipUpdate>,
}

impl Rollback {
    fn new(updates: Vec<RelationshipUpdate>) -> Self {
        Self { updates }
    }

    fn and(mut self, more: &[RelationshipUpdate]) -> Self {
        self.updates.extend(more.iter().cloned());
        self
    }

    async fn cleanup(&self, ctx: &mut WorkflowCtx) {
        let inverted: Vec<RelationshipUpdate> =
            self.updates.iter().map(RelationshipUpdate::invert).collect();
        let write = WriteRelationshipsInput {
            preconditions: Vec::new(),
            updates: inverted,
        };
        loop {
            match ctx.activity::<_, ()>(WRITE_TO_SPICEDB, &write).await {
                Ok(()) => break,
                Err(ActivityError::InvalidArgument(err)) => {
                    error!(instance = %ctx.instance_id(), error = %err, "unrecoverable error rolling back relationship updates");
                    break;
                }
                Err(err) => {
                    warn!(instance = %ctx.instance_id(), error = %err, "error rolling back relationship updates; retrying");
                    ctx.sleep(ROLLBACK_RETRY_DELAY).await;
                }
            }
        }
    }
}

/// The lock relationship serializing writers to one `(path, name, verb)`.
pub fn lock_relationship(input: &WriteInput, workflow_id: &str) -> Relationship {
    let key = format!(
        "{}/{}/{}",
        input.request.path,
        input.lock_name(),
        input.request.verb
    );
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    Relationship {
        resource_type: LOCK_RESOURCE_TYPE.to_string(),
        resource_id: format!("{:x}", hasher.finish()),
        relation: LOCK_RELATION.to_string(),
        subject_type: WORKFLOW_SUBJECT_TYPE.to_string(),
        subject_id: workflow_id.to_string(),
        subject_relation: None,
    }
}

fn lock_does_not_exist(lock: &Relationship) -> Precondition {
    Precondition {
        operation: PreconditionOp::MustNotMatch,
        filter: RelationshipFilter {
            resource_type: LOCK_RESOURCE_TYPE.to_string(),
            optional_resource_id: Some(lock.resource_id.clone()),
            optional_relation: Some(LOCK_RELATION.to_string()),
            optional_subject_filter: Some(SubjectFilter {
                subject_type: WORKFLOW_SUBJECT_TYPE.to_string(),
                optional_subject_id: None,
                optional_relation: None,
            }),
        },
    }
}

/// Statuses that complete a write. A conflicting create means an earlier
/// attempt of this workflow already created the object; a missing object on
/// delete means the same for deletion.
fn is_successful_write(verb: &str, status: u16) -> bool {
    match verb {
        "create" => matches!(status, 200 | 201 | 409),
        "delete" => matches!(status, 200 | 404),
        _ => (200..300).contains(&status),
    }
}

/// Where to probe for the written object's existence.
fn probe_path(input: &WriteInput) -> String {
    if input.request.verb == "create" {
        format!("{}/{}", input.request.path, input.lock_name())
    } else {
        input.request.path.clone()
    }
}

/// Exponential backoff with deterministic jitter. The jitter is derived
/// from the instance ID so a replayed orchestration computes identical
/// delays.
fn backoff_delay(instance_id: &str, retry: u32) -> Duration {
    let base = KUBE_BACKOFF_BASE_MS << retry.min(16);
    let mut hasher = XxHash64::with_seed(u64::from(retry));
    hasher.write(instance_id.as_bytes());
    let fraction = (hasher.finish() % 1_000) as f64 / 1_000.0;
    Duration::from_millis(base + (base as f64 * KUBE_BACKOFF_JITTER * fraction) as u64)
}

/// Synthesize a Kubernetes conflict response wrapping a permission-service
/// failure. Reporting every such failure as a conflict pushes the retry to
/// the client, which is the only party that can make progress.
fn kube_conflict(message: &str, input: &WriteInput) -> KubeResponse {
    let status = KubeStatus {
        kind: "Status".to_string(),
        api_version: "v1".to_string(),
        status: "Failure".to_string(),
        message: format!(
            "Operation cannot be fulfilled on {} {:?}: {}",
            input.request.resource,
            input.lock_name(),
            message
        ),
        reason: "Conflict".to_string(),
        code: 409,
        details: Some(KubeStatusDetails {
            name: input.lock_name().to_string(),
            group: input.request.api_group.clone(),
            kind: input.request.resource.clone(),
            retry_after_seconds: 0,
        }),
    };
    let body = serde_json::to_vec(&status).unwrap_or_default();
    KubeResponse {
        status: 409,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body,
        err_status: Some(status),
    }
}
