//! Permission service client
//!
//! Thin adapter over the SpiceDB wire API. The proxy issues five calls:
//! `CheckPermission`, `LookupResources`, `WatchRelationships`,
//! `ReadRelationships` and `WriteRelationships`. Retries are deliberately
//! not handled here; the workflow engine owns retry policy.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod proto;

pub use client::SpicedbClient;

/// Permission service errors.
///
/// `PreconditionFailed` is kept distinct from transport errors so that the
/// dual-write workflows can tell a lock conflict from an unreachable backend.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum SpiceDbError {
    #[error("write precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission service unavailable: {0}")]
    Unavailable(String),

    #[error("permission service protocol error: {0}")]
    Protocol(String),
}

/// A directed edge in the relationship graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_relation: Option<String>,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.resource_type, self.resource_id, self.relation, self.subject_type, self.subject_id
        )?;
        if let Some(rel) = &self.subject_relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

/// Write operation applied to a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipOp {
    Create,
    Touch,
    Delete,
}

impl RelationshipOp {
    /// The operation that undoes this one. `Delete` inverts to `Touch` so
    /// that restoring a deleted tuple is idempotent even if the tuple was
    /// never removed.
    pub fn invert(self) -> Self {
        match self {
            RelationshipOp::Create | RelationshipOp::Touch => RelationshipOp::Delete,
            RelationshipOp::Delete => RelationshipOp::Touch,
        }
    }
}

/// A relationship paired with the operation to apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: RelationshipOp,
    pub relationship: Relationship,
}

impl RelationshipUpdate {
    pub fn new(operation: RelationshipOp, relationship: Relationship) -> Self {
        Self {
            operation,
            relationship,
        }
    }

    /// The update that undoes this one.
    pub fn invert(&self) -> Self {
        Self {
            operation: self.operation.invert(),
            relationship: self.relationship.clone(),
        }
    }
}

/// Filter over the subject half of a relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFilter {
    pub subject_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_relation: Option<String>,
}

/// Partial relationship pattern used to enumerate or delete tuples.
/// Only the resource type is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_subject_filter: Option<SubjectFilter>,
}

impl RelationshipFilter {
    /// True when the relationship matches every populated component of the
    /// filter.
    pub fn matches(&self, rel: &Relationship) -> bool {
        if rel.resource_type != self.resource_type {
            return false;
        }
        if let Some(id) = &self.optional_resource_id {
            if &rel.resource_id != id {
                return false;
            }
        }
        if let Some(relation) = &self.optional_relation {
            if &rel.relation != relation {
                return false;
            }
        }
        if let Some(subject) = &self.optional_subject_filter {
            if rel.subject_type != subject.subject_type {
                return false;
            }
            if let Some(id) = &subject.optional_subject_id {
                if &rel.subject_id != id {
                    return false;
                }
            }
            if let Some(srel) = &subject.optional_relation {
                if rel.subject_relation.as_deref() != Some(srel.as_str()) {
                    return false;
                }
            }
        }
        true
    }
}

/// Predicate evaluated atomically with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionOp {
    MustMatch,
    MustNotMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub operation: PreconditionOp,
    pub filter: RelationshipFilter,
}

/// Result of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    HasPermission,
    NoPermission,
}

impl Decision {
    pub fn allowed(self) -> bool {
        matches!(self, Decision::HasPermission)
    }
}

/// A single permission check: does `subject` have `permission` on the
/// resource?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub permission: String,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_relation: Option<String>,
}

/// A LookupResources request: stream the IDs of every resource of
/// `resource_type` on which `subject` has `permission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub resource_type: String,
    pub permission: String,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_relation: Option<String>,
}

/// Stream of resource IDs from LookupResources.
pub type ResourceIdStream = BoxStream<'static, Result<String, SpiceDbError>>;

/// Stream of relationship updates from Watch.
pub type RelationshipUpdateStream = BoxStream<'static, Result<RelationshipUpdate, SpiceDbError>>;

/// Client surface of the permission service.
///
/// Implemented over gRPC by [`SpicedbClient`]; tests substitute an
/// in-memory implementation.
#[async_trait]
pub trait PermissionClient: Send + Sync {
    /// Check a single permission.
    async fn check_permission(&self, req: &CheckRequest) -> Result<Decision, SpiceDbError>;

    /// Stream the resource IDs the subject can act on.
    async fn lookup_resources(&self, req: &LookupRequest) -> Result<ResourceIdStream, SpiceDbError>;

    /// Stream relationship updates for the given resource object types.
    async fn watch_relationships(
        &self,
        object_types: Vec<String>,
    ) -> Result<RelationshipUpdateStream, SpiceDbError>;

    /// Read all relationships matching a filter.
    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>, SpiceDbError>;

    /// Transactionally apply `updates`, guarded by `preconditions`.
    /// Either every update commits at a single revision or none do.
    async fn write_relationships(
        &self,
        preconditions: Vec<Precondition>,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<(), SpiceDbError>;
}
