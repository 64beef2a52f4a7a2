//! gRPC implementation of [`PermissionClient`].
//!
//! Connects lazily so the proxy can start before the permission service is
//! reachable. Auth is a preshared token sent as `authorization: Bearer`
//! metadata on every call.

use futures::{StreamExt, TryStreamExt};
use tonic::codegen::InterceptedService;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Code;

use super::proto;
use super::proto::permissions_service_client::PermissionsServiceClient;
use super::proto::watch_service_client::WatchServiceClient;
use super::{
    CheckRequest, Decision, LookupRequest, PermissionClient, Precondition, PreconditionOp,
    Relationship, RelationshipFilter, RelationshipOp, RelationshipUpdate,
    RelationshipUpdateStream, ResourceIdStream, SpiceDbError, SubjectFilter,
};
use async_trait::async_trait;

impl From<tonic::Status> for SpiceDbError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::FailedPrecondition => {
                SpiceDbError::PreconditionFailed(status.message().to_string())
            }
            Code::InvalidArgument => SpiceDbError::InvalidArgument(status.message().to_string()),
            _ => SpiceDbError::Unavailable(format!("{}: {}", status.code(), status.message())),
        }
    }
}

/// Adds the preshared token to outgoing request metadata.
#[derive(Clone)]
struct AuthInterceptor {
    bearer: Option<MetadataValue<Ascii>>,
}

impl AuthInterceptor {
    fn new(token: Option<&str>) -> Result<Self, SpiceDbError> {
        let bearer = token
            .map(|t| {
                format!("Bearer {t}")
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|e| SpiceDbError::InvalidArgument(format!("invalid token: {e}")))
            })
            .transpose()?;
        Ok(Self { bearer })
    }
}

impl tonic::service::Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(bearer) = &self.bearer {
            request.metadata_mut().insert("authorization", bearer.clone());
        }
        Ok(request)
    }
}

type AuthedChannel = InterceptedService<Channel, AuthInterceptor>;

/// Permission client over a single multiplexed gRPC channel.
pub struct SpicedbClient {
    permissions: PermissionsServiceClient<AuthedChannel>,
    watch: WatchServiceClient<AuthedChannel>,
}

impl SpicedbClient {
    /// Create a client for `endpoint` (e.g. `http://spicedb:50051`).
    /// The connection is established on first use.
    pub fn connect_lazy(endpoint: &str, token: Option<&str>) -> Result<Self, SpiceDbError> {
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| SpiceDbError::InvalidArgument(format!("invalid endpoint: {e}")))?
            .connect_lazy();
        let interceptor = AuthInterceptor::new(token)?;
        let permissions =
            PermissionsServiceClient::with_interceptor(channel.clone(), interceptor.clone());
        let watch = WatchServiceClient::with_interceptor(channel, interceptor);
        Ok(Self { permissions, watch })
    }
}

#[async_trait]
impl PermissionClient for SpicedbClient {
    async fn check_permission(&self, req: &CheckRequest) -> Result<Decision, SpiceDbError> {
        let mut client = self.permissions.clone();
        let response = client
            .check_permission(proto::CheckPermissionRequest {
                consistency: Some(proto::Consistency::fully_consistent()),
                resource: Some(proto::ObjectReference {
                    object_type: req.resource_type.clone(),
                    object_id: req.resource_id.clone(),
                }),
                permission: req.permission.clone(),
                subject: Some(subject_reference(
                    &req.subject_type,
                    &req.subject_id,
                    req.subject_relation.as_deref(),
                )),
            })
            .await?
            .into_inner();

        use proto::check_permission_response::Permissionship;
        match Permissionship::try_from(response.permissionship) {
            Ok(Permissionship::HasPermission) => Ok(Decision::HasPermission),
            Ok(_) => Ok(Decision::NoPermission),
            Err(_) => Err(SpiceDbError::Protocol(format!(
                "unknown permissionship value {}",
                response.permissionship
            ))),
        }
    }

    async fn lookup_resources(&self, req: &LookupRequest) -> Result<ResourceIdStream, SpiceDbError> {
        let mut client = self.permissions.clone();
        let response = client
            .lookup_resources(proto::LookupResourcesRequest {
                consistency: Some(proto::Consistency::fully_consistent()),
                resource_object_type: req.resource_type.clone(),
                permission: req.permission.clone(),
                subject: Some(subject_reference(
                    &req.subject_type,
                    &req.subject_id,
                    req.subject_relation.as_deref(),
                )),
            })
            .await?;

        Ok(response
            .into_inner()
            .map(|item| {
                item.map(|resp| resp.resource_object_id)
                    .map_err(SpiceDbError::from)
            })
            .boxed())
    }

    async fn watch_relationships(
        &self,
        object_types: Vec<String>,
    ) -> Result<RelationshipUpdateStream, SpiceDbError> {
        let mut client = self.watch.clone();
        let response = client
            .watch(proto::WatchRequest {
                optional_object_types: object_types,
                optional_start_cursor: None,
            })
            .await?;

        Ok(response
            .into_inner()
            .map_err(SpiceDbError::from)
            .map_ok(|resp| {
                futures::stream::iter(
                    resp.updates
                        .into_iter()
                        .filter_map(from_proto_update)
                        .map(Ok::<_, SpiceDbError>),
                )
            })
            .try_flatten()
            .boxed())
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>, SpiceDbError> {
        let mut client = self.permissions.clone();
        let response = client
            .read_relationships(proto::ReadRelationshipsRequest {
                consistency: Some(proto::Consistency::fully_consistent()),
                relationship_filter: Some(to_proto_filter(filter)),
            })
            .await?;

        let mut stream = response.into_inner();
        let mut relationships = Vec::new();
        while let Some(item) = stream.next().await {
            let item = item.map_err(SpiceDbError::from)?;
            if let Some(rel) = item.relationship.and_then(from_proto_relationship) {
                relationships.push(rel);
            }
        }
        Ok(relationships)
    }

    async fn write_relationships(
        &self,
        preconditions: Vec<Precondition>,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<(), SpiceDbError> {
        let mut client = self.permissions.clone();
        client
            .write_relationships(proto::WriteRelationshipsRequest {
                updates: updates.iter().map(to_proto_update).collect(),
                optional_preconditions: preconditions.iter().map(to_proto_precondition).collect(),
            })
            .await?;
        Ok(())
    }
}

fn subject_reference(
    subject_type: &str,
    subject_id: &str,
    relation: Option<&str>,
) -> proto::SubjectReference {
    proto::SubjectReference {
        object: Some(proto::ObjectReference {
            object_type: subject_type.to_string(),
            object_id: subject_id.to_string(),
        }),
        optional_relation: relation.unwrap_or_default().to_string(),
    }
}

fn to_proto_relationship(rel: &Relationship) -> proto::Relationship {
    proto::Relationship {
        resource: Some(proto::ObjectReference {
            object_type: rel.resource_type.clone(),
            object_id: rel.resource_id.clone(),
        }),
        relation: rel.relation.clone(),
        subject: Some(subject_reference(
            &rel.subject_type,
            &rel.subject_id,
            rel.subject_relation.as_deref(),
        )),
    }
}

fn from_proto_relationship(rel: proto::Relationship) -> Option<Relationship> {
    let resource = rel.resource?;
    let subject = rel.subject?;
    let subject_object = subject.object?;
    Some(Relationship {
        resource_type: resource.object_type,
        resource_id: resource.object_id,
        relation: rel.relation,
        subject_type: subject_object.object_type,
        subject_id: subject_object.object_id,
        subject_relation: if subject.optional_relation.is_empty() {
            None
        } else {
            Some(subject.optional_relation)
        },
    })
}

fn to_proto_update(update: &RelationshipUpdate) -> proto::RelationshipUpdate {
    use proto::relationship_update::Operation;
    let operation = match update.operation {
        RelationshipOp::Create => Operation::Create,
        RelationshipOp::Touch => Operation::Touch,
        RelationshipOp::Delete => Operation::Delete,
    };
    proto::RelationshipUpdate {
        operation: operation as i32,
        relationship: Some(to_proto_relationship(&update.relationship)),
    }
}

fn from_proto_update(update: proto::RelationshipUpdate) -> Option<RelationshipUpdate> {
    use proto::relationship_update::Operation;
    let operation = match Operation::try_from(update.operation).ok()? {
        Operation::Create => RelationshipOp::Create,
        Operation::Touch => RelationshipOp::Touch,
        Operation::Delete => RelationshipOp::Delete,
        Operation::Unspecified => return None,
    };
    Some(RelationshipUpdate {
        operation,
        relationship: from_proto_relationship(update.relationship?)?,
    })
}

fn to_proto_filter(filter: &RelationshipFilter) -> proto::RelationshipFilter {
    proto::RelationshipFilter {
        resource_type: filter.resource_type.clone(),
        optional_resource_id: filter.optional_resource_id.clone().unwrap_or_default(),
        optional_relation: filter.optional_relation.clone().unwrap_or_default(),
        optional_subject_filter: filter.optional_subject_filter.as_ref().map(to_proto_subject_filter),
    }
}

fn to_proto_subject_filter(filter: &SubjectFilter) -> proto::SubjectFilter {
    proto::SubjectFilter {
        subject_type: filter.subject_type.clone(),
        optional_subject_id: filter.optional_subject_id.clone().unwrap_or_default(),
        optional_relation: filter
            .optional_relation
            .clone()
            .map(|relation| proto::subject_filter::RelationFilter { relation }),
    }
}

fn to_proto_precondition(precondition: &Precondition) -> proto::Precondition {
    use proto::precondition::Operation;
    let operation = match precondition.operation {
        PreconditionOp::MustMatch => Operation::MustMatch,
        PreconditionOp::MustNotMatch => Operation::MustNotMatch,
    };
    proto::Precondition {
        operation: operation as i32,
        filter: Some(to_proto_filter(&precondition.filter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Relationship {
        Relationship {
            resource_type: "namespace".into(),
            resource_id: "default".into(),
            relation: "creator".into(),
            subject_type: "user".into(),
            subject_id: "alice".into(),
            subject_relation: None,
        }
    }

    #[test]
    fn test_relationship_proto_round_trip() {
        let rel = sample();
        let restored = from_proto_relationship(to_proto_relationship(&rel)).unwrap();
        assert_eq!(restored, rel);
    }

    #[test]
    fn test_subject_relation_omitted_when_empty() {
        let proto_rel = to_proto_relationship(&sample());
        assert_eq!(proto_rel.subject.unwrap().optional_relation, "");

        let mut rel = sample();
        rel.subject_relation = Some("member".into());
        let restored = from_proto_relationship(to_proto_relationship(&rel)).unwrap();
        assert_eq!(restored.subject_relation.as_deref(), Some("member"));
    }

    #[test]
    fn test_unspecified_update_operation_is_dropped() {
        let update = proto::RelationshipUpdate {
            operation: 0,
            relationship: Some(to_proto_relationship(&sample())),
        };
        assert!(from_proto_update(update).is_none());
    }
}
