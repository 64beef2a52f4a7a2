//! Registered activities.
//!
//! Activities are the non-deterministic, side-effectful leaves of an
//! orchestration: network calls against the permission service and the
//! upstream Kubernetes API. They are dispatched by name so recorded history
//! stays meaningful across restarts.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::spicedb::{PermissionClient, Precondition, Relationship, RelationshipFilter, RelationshipUpdate};

use super::{ActivityError, KubeRequest, KubeResponse};

pub const WRITE_TO_SPICEDB: &str = "write_to_spicedb";
pub const WRITE_TO_KUBE: &str = "write_to_kube";
pub const CHECK_KUBE_RESOURCE: &str = "check_kube_resource";
pub const READ_RELATIONSHIPS: &str = "read_relationships";

/// Input of the [`WRITE_TO_SPICEDB`] activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRelationshipsInput {
    pub preconditions: Vec<Precondition>,
    pub updates: Vec<RelationshipUpdate>,
}

/// Input of the [`CHECK_KUBE_RESOURCE`] idempotency probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsProbe {
    pub path: String,
}

/// Upstream Kubernetes transport as the workflows see it. Implemented by the
/// proxy's upstream client; tests substitute fakes.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Execute the request. HTTP statuses of any kind are an `Ok` response;
    /// only transport failures are errors.
    async fn execute(&self, req: &KubeRequest) -> Result<KubeResponse, ActivityError>;

    /// Whether a GET of `path` finds the object (404 means no).
    async fn resource_exists(&self, path: &str) -> Result<bool, ActivityError>;
}

/// Executes activities by name against live backends.
#[derive(Clone)]
pub struct ActivityHandler {
    spicedb: Arc<dyn PermissionClient>,
    kube: Arc<dyn KubeClient>,
}

impl ActivityHandler {
    pub fn new(spicedb: Arc<dyn PermissionClient>, kube: Arc<dyn KubeClient>) -> Self {
        Self { spicedb, kube }
    }

    pub async fn execute(&self, name: &str, input: Value) -> Result<Value, ActivityError> {
        match name {
            WRITE_TO_SPICEDB => {
                let input: WriteRelationshipsInput = decode(input)?;
                self.spicedb
                    .write_relationships(input.preconditions, input.updates)
                    .await?;
                Ok(Value::Null)
            }
            WRITE_TO_KUBE => {
                let input: KubeRequest = decode(input)?;
                let response = self.kube.execute(&input).await?;
                encode(&response)
            }
            CHECK_KUBE_RESOURCE => {
                let input: ExistsProbe = decode(input)?;
                let exists = self.kube.resource_exists(&input.path).await?;
                encode(&exists)
            }
            READ_RELATIONSHIPS => {
                let filter: RelationshipFilter = decode(input)?;
                let relationships: Vec<Relationship> =
                    self.spicedb.read_relationships(&filter).await?;
                encode(&relationships)
            }
            _ => Err(ActivityError::Internal(format!(
                "unknown activity {name:?}"
            ))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ActivityError> {
    serde_json::from_value(input)
        .map_err(|e| ActivityError::Internal(format!("activity input decode: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(value)
        .map_err(|e| ActivityError::Internal(format!("activity output encode: {e}")))
}
