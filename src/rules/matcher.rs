//! Request-to-rule matching.
//!
//! Matching is pure and deterministic: rules are consulted in file order and
//! every selector must agree on group/version, resource and verb.

use crate::authz::RequestDescriptor;

use super::CompiledRule;

/// Indexes compiled rules and answers which apply to a request.
pub struct RuleMatcher {
    rules: Vec<CompiledRule>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<CompiledRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// All rules whose selectors match the request, in rule-file order.
    pub fn matching(&self, request: &RequestDescriptor) -> Vec<&CompiledRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches.iter().any(|m| selector_matches(m, request)))
            .collect()
    }
}

fn selector_matches(selector: &super::MatchSelector, request: &RequestDescriptor) -> bool {
    let (group, version) = selector.group_version();
    if group != request.api_group || version != request.api_version {
        return false;
    }
    // Empty or "*" matches any resource.
    if !selector.resource.is_empty()
        && selector.resource != "*"
        && selector.resource != request.resource
    {
        return false;
    }
    selector
        .verbs
        .iter()
        .any(|verb| verb == "*" || verb == &request.verb)
}
