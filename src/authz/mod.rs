//! Authorization pipeline
//!
//! Composes the rule matcher, the expression engine, the permission client
//! and the dual-write engine into one decision per request: bypass, deny,
//! perform a dual write, or filter the upstream response.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::expr::{evaluate, ExprError};
use crate::rules::{CompiledRule, LockMode, RuleMatcher};
use crate::spicedb::{CheckRequest, Decision, PermissionClient, Precondition, PreconditionOp};
use crate::workflow::{KubeRequest, KubeResponse, WorkflowEngine, WorkflowError, WriteInput};

pub mod filter;
pub mod input;

pub use filter::{AuthzData, FilterError, NamespacedName};
pub use input::{AuthzInput, RequestDescriptor, UserInfo, DEFAULT_BODY_LIMIT};

/// Authorization failures, each with a distinct HTTP disposition. Policy
/// denials are final; only infrastructure failures are retryable.
#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("failed to read request body: {0}")]
    BadRequest(String),

    #[error("request did not match any authorization rule")]
    NoMatch,

    #[error("request matched authorization rules but failed their conditions")]
    ConditionsUnmet,

    #[error("expression evaluation failed: {0}")]
    Template(#[from] ExprError),

    #[error("request failed authorization checks")]
    PermissionDenied,

    #[error("multiple matched rules declare updates for one request")]
    AmbiguousUpdate,

    #[error("permission service unreachable: {0}")]
    ReBacUnavailable(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl AuthzError {
    /// HTTP status this failure maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthzError::BadRequest(_) => 400,
            // Unmatched requests go through the fail handler, which answers
            // like an unauthenticated API server.
            AuthzError::NoMatch => 401,
            AuthzError::ConditionsUnmet
            | AuthzError::Template(_)
            | AuthzError::PermissionDenied => 403,
            AuthzError::AmbiguousUpdate => 500,
            // Retryable-deny: surfaced as a server error so well-behaved
            // clients back off and retry.
            AuthzError::ReBacUnavailable(_) => 503,
            AuthzError::Workflow(WorkflowError::UpstreamUnreachable(_)) => 504,
            AuthzError::Workflow(WorkflowError::Timeout(_)) => 504,
            AuthzError::Workflow(_) => 500,
        }
    }
}

/// Successful authorization outcomes.
#[derive(Debug)]
pub enum Authorized {
    /// A dual write ran; respond with the workflow's response verbatim.
    Write(KubeResponse),
    /// Read path: proxy upstream and filter the response.
    Filtered(AuthzData),
}

/// Paths that bypass authorization entirely: harmless API metadata probes
/// every client issues during discovery.
pub fn is_metadata_probe(method: &str, path: &str) -> bool {
    method == "GET" && matches!(path, "/api" | "/apis" | "/openapi/v2")
}

/// The authorization pipeline.
pub struct Authorizer {
    matcher: RuleMatcher,
    client: Arc<dyn PermissionClient>,
    engine: WorkflowEngine,
    default_lock: LockMode,
}

impl Authorizer {
    pub fn new(
        matcher: RuleMatcher,
        client: Arc<dyn PermissionClient>,
        engine: WorkflowEngine,
        default_lock: LockMode,
    ) -> Self {
        Self {
            matcher,
            client,
            engine,
            default_lock,
        }
    }

    /// Authorize one extracted request.
    pub async fn authorize(&self, input: &AuthzInput) -> Result<Authorized, AuthzError> {
        let matched = self.matcher.matching(&input.request);
        if matched.is_empty() {
            info!(
                verb = %input.request.verb,
                group = %input.request.api_group,
                version = %input.request.api_version,
                resource = %input.request.resource,
                "request did not match any authorization rule"
            );
            return Err(AuthzError::NoMatch);
        }

        let bindings = input.bindings();

        // Rules whose conditions evaluate false drop out silently; any
        // non-boolean condition result is an evaluation error.
        let mut surviving: Vec<&CompiledRule> = Vec::new();
        for rule in matched {
            let mut holds = true;
            for condition in &rule.conditions {
                match evaluate(&condition.expr, &bindings) {
                    Ok(Value::Bool(true)) => {}
                    Ok(Value::Bool(false)) => {
                        holds = false;
                        break;
                    }
                    Ok(other) => {
                        return Err(AuthzError::Template(ExprError::Type(format!(
                            "condition {:?} evaluated to non-boolean {other}",
                            condition.source
                        ))));
                    }
                    Err(e) => return Err(AuthzError::Template(e)),
                }
            }
            if holds {
                surviving.push(rule);
            }
        }
        if surviving.is_empty() {
            info!(
                verb = %input.request.verb,
                resource = %input.request.resource,
                "request matched authorization rules but failed their conditions"
            );
            return Err(AuthzError::ConditionsUnmet);
        }

        debug!(
            rules = surviving.len(),
            verb = %input.request.verb,
            resource = %input.request.resource,
            "request matched authorization rules"
        );

        self.run_all_checks(&surviving, input).await?;

        if let Some(rule) = single_update_rule(&surviving)? {
            let write_input = render_write_input(rule, input)?;
            let strategy = rule.locking.unwrap_or(self.default_lock);
            let response = self.engine.dispatch(strategy, write_input).await?;
            return Ok(Authorized::Write(response));
        }

        let data = AuthzData::build(&surviving, input, self.client.clone()).await?;
        Ok(Authorized::Filtered(data))
    }

    /// Render every check across the surviving rules and dispatch them in
    /// parallel. The verdict is all-must-pass with no ordering dependence.
    async fn run_all_checks(
        &self,
        rules: &[&CompiledRule],
        input: &AuthzInput,
    ) -> Result<(), AuthzError> {
        let bindings = input.bindings();
        let mut checks: Vec<CheckRequest> = Vec::new();
        for rule in rules {
            for template in &rule.checks {
                checks.push(template.render_check(&bindings)?);
            }
        }
        if checks.is_empty() {
            return Ok(());
        }

        let results = futures::future::join_all(checks.iter().map(|check| {
            let client = self.client.clone();
            async move { client.check_permission(check).await }
        }))
        .await;

        for (check, result) in checks.iter().zip(results) {
            match result {
                Ok(Decision::HasPermission) => crate::metrics::record_check("allowed"),
                Ok(Decision::NoPermission) => {
                    crate::metrics::record_check("denied");
                    info!(
                        resource = %format!("{}:{}", check.resource_type, check.resource_id),
                        permission = %check.permission,
                        subject = %format!("{}:{}", check.subject_type, check.subject_id),
                        "permission check denied"
                    );
                    return Err(AuthzError::PermissionDenied);
                }
                Err(e) => {
                    crate::metrics::record_check("error");
                    return Err(AuthzError::ReBacUnavailable(e.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// At most one surviving rule may declare updates for a request.
fn single_update_rule<'a>(
    rules: &[&'a CompiledRule],
) -> Result<Option<&'a CompiledRule>, AuthzError> {
    let mut update_rules = rules.iter().filter(|rule| rule.has_update());
    let first = update_rules.next();
    if update_rules.next().is_some() {
        return Err(AuthzError::AmbiguousUpdate);
    }
    Ok(first.copied())
}

/// Render the rule's update block into a fully concrete workflow input.
fn render_write_input(rule: &CompiledRule, input: &AuthzInput) -> Result<WriteInput, AuthzError> {
    let bindings = input.bindings();

    let mut preconditions = Vec::new();
    for template in &rule.update.precondition_exists {
        preconditions.push(Precondition {
            operation: PreconditionOp::MustMatch,
            filter: template.render_filter(&bindings)?,
        });
    }
    for template in &rule.update.precondition_does_not_exist {
        preconditions.push(Precondition {
            operation: PreconditionOp::MustNotMatch,
            filter: template.render_filter(&bindings)?,
        });
    }

    let render_all = |templates: &[crate::expr::RelationshipTemplate]| {
        templates
            .iter()
            .map(|t| t.render_relationship(&bindings))
            .collect::<Result<Vec<_>, _>>()
    };

    let path_and_query = match &input.raw_query {
        Some(query) if !query.is_empty() => format!("{}?{}", input.request.path, query),
        _ => input.request.path.clone(),
    };
    let headers = input
        .headers
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.clone())))
        .collect();

    Ok(WriteInput {
        request: input.request.clone(),
        user: input.user.clone(),
        object_name: input.object_name(),
        kube_request: KubeRequest {
            method: method_for_verb(&input.request.verb).to_string(),
            path_and_query,
            headers,
            body: input.body.clone(),
        },
        preconditions,
        creates: render_all(&rule.update.creates)?,
        touches: render_all(&rule.update.touches)?,
        deletes: render_all(&rule.update.deletes)?,
        delete_by_filter: rule
            .update
            .delete_by_filter
            .iter()
            .map(|t| t.render_filter(&bindings))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn method_for_verb(verb: &str) -> &'static str {
    match verb {
        "create" => "POST",
        "update" => "PUT",
        "patch" => "PATCH",
        "delete" | "deletecollection" => "DELETE",
        _ => "GET",
    }
}
