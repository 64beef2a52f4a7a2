//! Authorization input extraction.
//!
//! Parses an incoming HTTP request into the immutable input every later
//! stage consumes: the request descriptor, the authenticated user, headers,
//! and the parsed body for write verbs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::Bindings;

/// Maximum request body read for authorization purposes.
pub const DEFAULT_BODY_LIMIT: usize = 3 * 1024 * 1024;

/// Identity produced by the authenticator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// What a request asks of the Kubernetes API, derived once from the HTTP
/// method and path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub verb: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub namespace: String,
    pub path: String,
}

impl RequestDescriptor {
    /// Parse a resource request. Returns `None` for non-resource paths
    /// (`/api`, `/version`, `/healthz`, ...).
    pub fn parse(method: &str, path: &str, query: Option<&str>) -> Option<Self> {
        let trimmed = path.trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

        // /api/v1/... or /apis/{group}/{version}/...
        let (api_group, api_version, rest) = match segments.split_first()? {
            (&"api", rest) => {
                let (version, rest) = rest.split_first()?;
                (String::new(), (*version).to_string(), rest)
            }
            (&"apis", rest) => {
                let (group, rest) = rest.split_first()?;
                let (version, rest) = rest.split_first()?;
                ((*group).to_string(), (*version).to_string(), rest)
            }
            _ => return None,
        };

        let mut namespace = String::new();
        let mut parts = rest;
        if let Some((&"namespaces", rest)) = parts.split_first() {
            match rest {
                // /api/v1/namespaces or /api/v1/namespaces/{name} address the
                // namespace objects themselves.
                [] => {}
                [_name] => {}
                _ => {
                    namespace = rest[0].to_string();
                    parts = &rest[1..];
                }
            }
        }

        let (resource, rest) = parts.split_first()?;
        let name = rest.first().map(|s| (*s).to_string()).unwrap_or_default();
        let subresource = rest.get(1).map(|s| (*s).to_string()).unwrap_or_default();

        let watch = query
            .unwrap_or_default()
            .split('&')
            .any(|pair| pair == "watch=true" || pair == "watch=1");
        let verb = match method {
            "GET" | "HEAD" => {
                if watch {
                    "watch"
                } else if name.is_empty() {
                    "list"
                } else {
                    "get"
                }
            }
            "POST" => "create",
            "PUT" => "update",
            "PATCH" => "patch",
            "DELETE" => {
                if name.is_empty() {
                    "deletecollection"
                } else {
                    "delete"
                }
            }
            _ => return None,
        };

        Some(Self {
            verb: verb.to_string(),
            api_group,
            api_version,
            resource: (*resource).to_string(),
            subresource,
            name,
            namespace,
            path: path.to_string(),
        })
    }

    /// True for write verbs whose body feeds expression evaluation.
    pub fn reads_body(&self) -> bool {
        matches!(self.verb.as_str(), "create" | "update" | "patch")
    }
}

/// The immutable per-request aggregate handed to matching, expression
/// evaluation and the workflows.
#[derive(Debug, Clone)]
pub struct AuthzInput {
    pub request: RequestDescriptor,
    pub user: UserInfo,
    pub headers: BTreeMap<String, Vec<String>>,
    /// Raw query string, preserved for upstream forwarding.
    pub raw_query: Option<String>,
    /// Parsed body for write verbs; `Null` when absent or unparsable.
    pub object: Value,
    /// Raw body bytes, kept even when parsing fails.
    pub body: Vec<u8>,
}

impl AuthzInput {
    pub fn new(
        request: RequestDescriptor,
        user: UserInfo,
        headers: BTreeMap<String, Vec<String>>,
        raw_query: Option<String>,
        body: Vec<u8>,
    ) -> Self {
        let object = if request.reads_body() && !body.is_empty() {
            parse_object(&body)
        } else {
            Value::Null
        };
        Self {
            request,
            user,
            headers,
            raw_query,
            object,
            body,
        }
    }

    /// Object name: from the body's metadata when present (creates), from
    /// the URL otherwise.
    pub fn object_name(&self) -> String {
        self.object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.request.name.clone())
    }

    /// Namespace of the addressed resource, preferring the body's metadata.
    pub fn resource_namespace(&self) -> String {
        self.object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.request.namespace.clone())
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn namespaced_name(&self) -> String {
        let name = self.object_name();
        let namespace = self.resource_namespace();
        if namespace.is_empty() {
            name
        } else {
            format!("{namespace}/{name}")
        }
    }

    /// The variable bindings every rule expression sees.
    pub fn bindings(&self) -> Bindings {
        Bindings::new()
            .bind("request", serde_json::to_value(&self.request).unwrap_or(Value::Null))
            .bind("user", serde_json::to_value(&self.user).unwrap_or(Value::Null))
            .bind("object", self.object.clone())
            .bind("name", Value::String(self.object_name()))
            .bind("resourceNamespace", Value::String(self.resource_namespace()))
            .bind("namespacedName", Value::String(self.namespaced_name()))
            .bind(
                "headers",
                serde_json::to_value(&self.headers).unwrap_or(Value::Null),
            )
            .bind(
                "body",
                Value::String(String::from_utf8_lossy(&self.body).into_owned()),
            )
    }
}

/// Parse a request body as JSON, then as YAML. Unparsable bodies are kept
/// raw and the `object` variable stays null.
fn parse_object(body: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    match serde_yaml::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => Value::Null,
    }
}
