//! Durable dual-write workflows
//!
//! Mutating requests must land in both the permission service and the
//! upstream Kubernetes API, or in neither. There is no distributed
//! transaction spanning the two, so the proxy runs each write as a durable
//! orchestration: deterministic glue code whose side effects all happen in
//! recorded *activities*. Orchestration history is persisted, and a process
//! crash replays the orchestration from its last completed activity.
//!
//! Two strategies are registered:
//! - [`dualwrite::pessimistic_write`] serializes concurrent writers to the
//!   same `(path, name, verb)` key with a lock relationship.
//! - [`dualwrite::optimistic_write`] writes first and rolls back on failure,
//!   leaving conflict handling to the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authz::{RequestDescriptor, UserInfo};
use crate::spicedb::{Precondition, Relationship, RelationshipFilter, SpiceDbError};

pub mod activities;
pub mod dualwrite;
pub mod engine;
pub mod store;

pub use activities::ActivityHandler;
pub use engine::{WorkflowCtx, WorkflowEngine};
pub use store::HistoryStore;

/// Upper bound on upstream write attempts within one workflow.
pub const MAX_KUBE_ATTEMPTS: u32 = 5;

/// How long a caller waits for a workflow before giving up. The workflow
/// itself keeps running; durability outranks client patience.
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Workflow-level failures. Policy denials never reach this type; these are
/// operational failures of the orchestration itself.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowError {
    #[error("failed to communicate with kubernetes: {0}")]
    UpstreamUnreachable(String),

    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("workflow timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow internal error: {0}")]
    Internal(String),
}

/// Failure of a single activity, recorded in history so replays observe the
/// same outcome. `PreconditionFailed` stays distinguishable from transport
/// errors; the orchestrations branch on it.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ActivityError {
    #[error("write precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("activity failed: {0}")]
    Internal(String),
}

impl From<SpiceDbError> for ActivityError {
    fn from(err: SpiceDbError) -> Self {
        match err {
            SpiceDbError::PreconditionFailed(msg) => ActivityError::PreconditionFailed(msg),
            SpiceDbError::InvalidArgument(msg) => ActivityError::InvalidArgument(msg),
            SpiceDbError::Unavailable(msg) => ActivityError::Unavailable(msg),
            SpiceDbError::Protocol(msg) => ActivityError::Internal(msg),
        }
    }
}

/// The upstream HTTP call a workflow performs, captured verbatim from the
/// proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

/// Outcome of an upstream HTTP call. Every HTTP status is represented here;
/// only transport failures surface as activity errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    /// Parsed `Status` body, when the upstream returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_status: Option<KubeStatus>,
}

impl KubeResponse {
    /// Server-requested retry delay, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.err_status
            .as_ref()
            .and_then(|status| status.details.as_ref())
            .map(|details| details.retry_after_seconds)
            .filter(|&secs| secs > 0)
    }
}

/// Subset of the Kubernetes `metav1.Status` shape the workflows inspect and
/// synthesize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeStatus {
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<KubeStatusDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeStatusDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "retryAfterSeconds")]
    pub retry_after_seconds: u64,
}

/// Fully rendered input to a dual-write workflow. Everything the
/// orchestration needs is captured up front so replays see identical input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteInput {
    pub request: RequestDescriptor,
    pub user: UserInfo,
    /// Name of the object being written. Create names come from the request
    /// body's metadata; delete names come from the URL.
    pub object_name: String,
    pub kube_request: KubeRequest,
    pub preconditions: Vec<Precondition>,
    pub creates: Vec<Relationship>,
    pub touches: Vec<Relationship>,
    pub deletes: Vec<Relationship>,
    pub delete_by_filter: Vec<RelationshipFilter>,
}

impl WriteInput {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.user.name.is_empty() {
            return Err(WorkflowError::InvalidInput(
                "missing user info in write input".into(),
            ));
        }
        Ok(())
    }

    /// The object name used for lock keys and idempotency probes.
    pub fn lock_name(&self) -> &str {
        if self.object_name.is_empty() {
            &self.request.name
        } else {
            &self.object_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_requires_positive_seconds() {
        let mut resp = KubeResponse {
            status: 429,
            headers: vec![],
            body: vec![],
            err_status: Some(KubeStatus {
                details: Some(KubeStatusDetails {
                    retry_after_seconds: 0,
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };
        assert_eq!(resp.retry_after_seconds(), None);

        resp.err_status.as_mut().unwrap().details.as_mut().unwrap().retry_after_seconds = 3;
        assert_eq!(resp.retry_after_seconds(), Some(3));
    }

    #[test]
    fn test_status_parses_kube_wire_form() {
        let body = r#"{
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "too many requests",
            "reason": "TooManyRequests",
            "code": 429,
            "details": {"retryAfterSeconds": 5}
        }"#;
        let status: KubeStatus = serde_json::from_str(body).unwrap();
        assert_eq!(status.reason, "TooManyRequests");
        assert_eq!(status.details.unwrap().retry_after_seconds, 5);
    }
}
