//! Proxy rule configuration
//!
//! Rules are loaded from a YAML stream of `ProxyRule` documents and compiled
//! into matchable, pre-parsed form at startup. A rule binds a set of request
//! selectors to optional `if` conditions, permission checks, prefilters for
//! collection responses, and a relationship update block for writes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::{self, Expr, ExprError, RelationshipTemplate};

pub mod matcher;

pub use matcher::RuleMatcher;

/// Expected document type for rule files.
pub const RULE_API_VERSION: &str = "authzed.com/v1alpha1";
pub const RULE_KIND: &str = "ProxyRule";

/// Bytes sniffed from the head of a rule stream to distinguish JSON from
/// YAML input.
const LOOKAHEAD: usize = 100;

/// Rule loading and compilation errors. All of these are configuration
/// errors and fatal at startup.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rules: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse rules: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid rule: {0}")]
    Validation(String),

    #[error("invalid rule expression: {0}")]
    Expression(#[from] ExprError),
}

/// Locking strategy for dual writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Write first, roll back on failure; concurrent writers race.
    Optimistic,
    /// Serialize concurrent writers with a lock relationship.
    Pessimistic,
}

/// One `ProxyRule` document as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,

    /// Locking mode override; the server default applies when unset.
    #[serde(default)]
    pub lock: Option<LockMode>,

    /// Request selectors. Cannot be empty.
    #[serde(rename = "match")]
    pub matches: Vec<MatchSelector>,

    /// Boolean expressions that must all hold for the rule to apply.
    #[serde(default, rename = "if")]
    pub conditions: Vec<String>,

    /// Permission checks to run when the rule applies.
    #[serde(default, rename = "check")]
    pub checks: Vec<StringOrTemplate>,

    /// LookupResources prefilters for list and watch requests.
    #[serde(default, rename = "prefilter")]
    pub prefilters: Vec<PreFilterSpec>,

    /// Relationship updates for write requests.
    #[serde(default)]
    pub update: UpdateSpec,
}

/// Selects requests by group/version, resource and verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSelector {
    /// `<group>/<version>`, or just `<version>` for the core group.
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Resource plural name; empty or `*` matches any resource.
    #[serde(default)]
    pub resource: String,
    pub verbs: Vec<String>,
}

impl MatchSelector {
    /// Split the selector's `apiVersion` into (group, version).
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

/// Either a template string (`tpl: "..."`) or an inline structured
/// relationship template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringOrTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ObjectTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<ObjectTemplateSpec>,
}

/// One half of a structured relationship template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectTemplateSpec {
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub relation: String,
}

/// A LookupResources prefilter. The lookup template enumerates authorized
/// resource IDs; the two expressions extract the allowed name and namespace
/// from each streamed ID (bound as `resourceId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreFilterSpec {
    #[serde(default, rename = "fromObjectIDNameExpr")]
    pub name_expr: String,
    #[serde(default, rename = "fromObjectIDNamespaceExpr")]
    pub namespace_expr: String,
    #[serde(rename = "lookupMatchingResources")]
    pub lookup: StringOrTemplate,
}

/// Relationship updates performed when a write request is authorized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(default, rename = "preconditionExists")]
    pub precondition_exists: Vec<StringOrTemplate>,
    #[serde(default, rename = "preconditionDoesNotExist")]
    pub precondition_does_not_exist: Vec<StringOrTemplate>,
    #[serde(default, rename = "creates")]
    pub creates: Vec<StringOrTemplate>,
    #[serde(default, rename = "touches")]
    pub touches: Vec<StringOrTemplate>,
    #[serde(default, rename = "deletes")]
    pub deletes: Vec<StringOrTemplate>,
    #[serde(default, rename = "deleteByFilter")]
    pub delete_by_filter: Vec<StringOrTemplate>,
}

impl UpdateSpec {
    pub fn is_empty(&self) -> bool {
        self.precondition_exists.is_empty()
            && self.precondition_does_not_exist.is_empty()
            && self.creates.is_empty()
            && self.touches.is_empty()
            && self.deletes.is_empty()
            && self.delete_by_filter.is_empty()
    }
}

/// A rule with every expression and template pre-parsed.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub locking: Option<LockMode>,
    pub matches: Vec<MatchSelector>,
    pub conditions: Vec<CompiledCondition>,
    pub checks: Vec<RelationshipTemplate>,
    pub prefilters: Vec<CompiledPreFilter>,
    pub update: CompiledUpdate,
}

#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub source: String,
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct CompiledPreFilter {
    pub name_expr: Expr,
    pub namespace_expr: Option<Expr>,
    pub lookup: RelationshipTemplate,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledUpdate {
    pub precondition_exists: Vec<RelationshipTemplate>,
    pub precondition_does_not_exist: Vec<RelationshipTemplate>,
    pub creates: Vec<RelationshipTemplate>,
    pub touches: Vec<RelationshipTemplate>,
    pub deletes: Vec<RelationshipTemplate>,
    pub delete_by_filter: Vec<RelationshipTemplate>,
}

impl CompiledUpdate {
    pub fn is_empty(&self) -> bool {
        self.precondition_exists.is_empty()
            && self.precondition_does_not_exist.is_empty()
            && self.creates.is_empty()
            && self.touches.is_empty()
            && self.deletes.is_empty()
            && self.delete_by_filter.is_empty()
    }
}

impl CompiledRule {
    pub fn has_update(&self) -> bool {
        !self.update.is_empty()
    }
}

/// Parse a rule stream. YAML documents separated by `---` are the common
/// form; a stream whose first non-blank byte (within the lookahead window)
/// is `{` is treated as JSON.
pub fn parse(input: &str) -> Result<Vec<RuleConfig>, RuleError> {
    let head = &input.as_bytes()[..input.len().min(LOOKAHEAD)];
    let first = head.iter().find(|b| !b.is_ascii_whitespace());
    let configs: Vec<RuleConfig> = if first == Some(&b'{') {
        vec![serde_json::from_str(input)?]
    } else {
        let mut configs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(input) {
            configs.push(RuleConfig::deserialize(document)?);
        }
        configs
    };

    for config in &configs {
        validate(config)?;
    }
    Ok(configs)
}

/// Load and compile rules from a file.
pub fn load(path: &std::path::Path) -> Result<Vec<CompiledRule>, RuleError> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)?.into_iter().map(compile).collect()
}

fn validate(config: &RuleConfig) -> Result<(), RuleError> {
    if config.api_version != RULE_API_VERSION {
        return Err(RuleError::Validation(format!(
            "unsupported apiVersion {:?}, expected {RULE_API_VERSION:?}",
            config.api_version
        )));
    }
    if config.kind != RULE_KIND {
        return Err(RuleError::Validation(format!(
            "unsupported kind {:?}, expected {RULE_KIND:?}",
            config.kind
        )));
    }
    if config.matches.is_empty() {
        return Err(RuleError::Validation("rule has no match selectors".into()));
    }
    for selector in &config.matches {
        if selector.verbs.is_empty() {
            return Err(RuleError::Validation(format!(
                "selector for {:?} has no verbs",
                selector.api_version
            )));
        }
    }
    Ok(())
}

/// Compile a rule document, parsing every expression and template and
/// validating wildcard placement.
pub fn compile(config: RuleConfig) -> Result<CompiledRule, RuleError> {
    let conditions = config
        .conditions
        .iter()
        .map(|source| -> Result<CompiledCondition, RuleError> {
            Ok(CompiledCondition {
                source: source.clone(),
                expr: expr::parse(source)?,
            })
        })
        .collect::<Result<Vec<_>, RuleError>>()?;

    let checks = compile_templates(&config.checks, false)?;

    let prefilters = config
        .prefilters
        .iter()
        .map(|spec| -> Result<CompiledPreFilter, RuleError> {
            let lookup = compile_template(&spec.lookup)?;
            lookup.validate_wildcard(true)?;
            // A missing name expression passes the looked-up ID through
            // unchanged; a missing namespace expression means cluster scope.
            let name_expr = if spec.name_expr.is_empty() {
                expr::parse("resourceId")?
            } else {
                expr::parse(&spec.name_expr)?
            };
            let namespace_expr = if spec.namespace_expr.is_empty() {
                None
            } else {
                Some(expr::parse(&spec.namespace_expr)?)
            };
            Ok(CompiledPreFilter {
                name_expr,
                namespace_expr,
                lookup,
            })
        })
        .collect::<Result<Vec<_>, RuleError>>()?;

    let update = CompiledUpdate {
        precondition_exists: compile_templates(&config.update.precondition_exists, false)?,
        precondition_does_not_exist: compile_templates(
            &config.update.precondition_does_not_exist,
            false,
        )?,
        creates: compile_templates(&config.update.creates, false)?,
        touches: compile_templates(&config.update.touches, false)?,
        deletes: compile_templates(&config.update.deletes, false)?,
        delete_by_filter: compile_templates(&config.update.delete_by_filter, false)?,
    };

    Ok(CompiledRule {
        locking: config.lock,
        matches: config.matches,
        conditions,
        checks,
        prefilters,
        update,
    })
}

fn compile_templates(
    specs: &[StringOrTemplate],
    allow_wildcard: bool,
) -> Result<Vec<RelationshipTemplate>, RuleError> {
    specs
        .iter()
        .map(|spec| -> Result<RelationshipTemplate, RuleError> {
            let template = compile_template(spec)?;
            template.validate_wildcard(allow_wildcard)?;
            Ok(template)
        })
        .collect()
}

fn compile_template(spec: &StringOrTemplate) -> Result<RelationshipTemplate, RuleError> {
    if let Some(tpl) = &spec.tpl {
        return Ok(RelationshipTemplate::parse(tpl)?);
    }
    match (&spec.resource, &spec.subject) {
        (Some(resource), subject) => {
            let subject = subject.clone().unwrap_or_default();
            Ok(RelationshipTemplate::from_parts(
                &resource.object_type,
                &resource.id,
                &resource.relation,
                &subject.object_type,
                &subject.id,
                &subject.relation,
            )?)
        }
        _ => Err(RuleError::Validation(
            "template must set either tpl or resource/subject".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
lock: Pessimistic
match:
- apiVersion: v1
  resource: pods
  verbs: ["create"]
if:
- "resourceNamespace == 'default'"
check:
- tpl: "namespace:{{resourceNamespace}}#manage@user:{{user.name}}"
update:
  creates:
  - tpl: "pod:{{namespacedName}}#owner@user:{{user.name}}"
---
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["list", "watch"]
prefilter:
- fromObjectIDNameExpr: "split(resourceId, '/')[1]"
  fromObjectIDNamespaceExpr: "split(resourceId, '/')[0]"
  lookupMatchingResources:
    tpl: "pod:$#view@user:{{user.name}}"
"#;

    #[test]
    fn test_parse_yaml_stream() {
        let configs = parse(RULES).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].lock, Some(LockMode::Pessimistic));
        assert_eq!(configs[0].matches[0].resource, "pods");
        assert_eq!(configs[1].prefilters.len(), 1);
    }

    #[test]
    fn test_compile_rules() {
        let rules: Vec<CompiledRule> = parse(RULES)
            .unwrap()
            .into_iter()
            .map(|c| compile(c).unwrap())
            .collect();
        assert!(rules[0].has_update());
        assert_eq!(rules[0].conditions.len(), 1);
        assert!(!rules[1].has_update());
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{
            "apiVersion": "authzed.com/v1alpha1",
            "kind": "ProxyRule",
            "match": [{"apiVersion": "v1", "resource": "pods", "verbs": ["get"]}],
            "check": [{"tpl": "pod:{{name}}#view@user:{{user.name}}"}]
        }"#;
        let configs = parse(json).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].checks.len(), 1);
    }

    #[test]
    fn test_structured_template_compiles() {
        let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: apps/v1
  resource: deployments
  verbs: ["create"]
update:
  creates:
  - resource:
      type: deployment
      id: "{{namespacedName}}"
      relation: owner
    subject:
      type: user
      id: "{{user.name}}"
"#;
        let rules = parse(yaml).unwrap();
        let compiled = compile(rules.into_iter().next().unwrap()).unwrap();
        assert_eq!(compiled.update.creates.len(), 1);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: NotARule
match:
- apiVersion: v1
  resource: pods
  verbs: ["get"]
"#;
        assert!(matches!(parse(yaml), Err(RuleError::Validation(_))));
    }

    #[test]
    fn test_wildcard_outside_prefilter_rejected() {
        let yaml = r#"
apiVersion: authzed.com/v1alpha1
kind: ProxyRule
match:
- apiVersion: v1
  resource: pods
  verbs: ["get"]
check:
- tpl: "pod:$#view@user:{{user.name}}"
"#;
        let config = parse(yaml).unwrap().into_iter().next().unwrap();
        assert!(compile(config).is_err());
    }

    #[test]
    fn test_group_version_split() {
        let core = MatchSelector {
            api_version: "v1".into(),
            resource: "pods".into(),
            verbs: vec!["get".into()],
        };
        assert_eq!(core.group_version(), ("", "v1"));

        let grouped = MatchSelector {
            api_version: "apps/v1".into(),
            resource: "deployments".into(),
            verbs: vec!["get".into()],
        };
        assert_eq!(grouped.group_version(), ("apps", "v1"));
    }
}
