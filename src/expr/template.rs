//! Relationship templates.
//!
//! Templates render to the grammar
//! `resourceType:resourceID#relation@subjectType:subjectID[#subjectRelation]`
//! with `{{ expr }}` interpolation in any slot. The structural characters
//! `:`, `#` and `@` are only significant outside `{{ }}` bodies, so
//! expressions may freely contain them.
//!
//! The literal `$` in the resource-ID slot is the LookupResources wildcard:
//! it marks the ID being enumerated. It is rejected anywhere else.

use crate::spicedb::{
    CheckRequest, LookupRequest, Relationship, RelationshipFilter, SubjectFilter,
};

use super::eval::stringify;
use super::parser::Expr;
use super::{evaluate, parse, Bindings, ExprError};

/// The resource-ID wildcard recognized in LookupResources templates.
pub const WILDCARD_ID: &str = "$";

/// Slot value that omits a filter component.
const MATCH_ANY: &str = "*";

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A string with `{{ expr }}` interpolations.
#[derive(Debug, Clone)]
pub struct TemplateString {
    segments: Vec<Segment>,
}

impl TemplateString {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            segments: scan(source)?,
        })
    }

    /// Render against bindings, producing a concrete string.
    pub fn render(&self, bindings: &Bindings) -> Result<String, ExprError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&stringify(&evaluate(expr, bindings)?)?),
            }
        }
        Ok(out)
    }

    /// True when the template is exactly the literal `$`.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::Literal(text)] if text == WILDCARD_ID)
    }

    fn literal_contains_wildcard(&self) -> bool {
        self.segments.iter().any(
            |segment| matches!(segment, Segment::Literal(text) if text.contains(WILDCARD_ID)),
        )
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Subject half of a relationship template.
#[derive(Debug, Clone)]
pub struct SubjectTemplate {
    pub subject_type: TemplateString,
    pub subject_id: TemplateString,
    pub subject_relation: Option<TemplateString>,
}

/// A relationship where any component may be templated, and trailing
/// components may be omitted when the template describes a filter.
#[derive(Debug, Clone)]
pub struct RelationshipTemplate {
    pub resource_type: TemplateString,
    pub resource_id: Option<TemplateString>,
    pub relation: Option<TemplateString>,
    pub subject: Option<SubjectTemplate>,
}

impl RelationshipTemplate {
    /// Parse the string form of a template.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let segments = scan(source)?;
        let (resource_part, subject_part) = match split_at(&segments, '@') {
            Some((left, right)) => (left, Some(right)),
            None => (segments, None),
        };

        let (resource_type, resource_rest) = match split_at(&resource_part, ':') {
            Some((left, right)) => (left, Some(right)),
            None => (resource_part, None),
        };
        let (resource_id, relation) = match resource_rest {
            None => (None, None),
            Some(rest) => match split_at(&rest, '#') {
                Some((left, right)) => (Some(rest_to_template(left)), Some(rest_to_template(right))),
                None => (Some(rest_to_template(rest)), None),
            },
        };

        let subject = subject_part
            .map(|part| -> Result<SubjectTemplate, ExprError> {
                let (subject_type, rest) = split_at(&part, ':').ok_or_else(|| {
                    ExprError::Template(format!("subject in {source:?} must be type:id"))
                })?;
                let (subject_id, subject_relation) = match split_at(&rest, '#') {
                    Some((left, right)) => (rest_to_template(left), Some(rest_to_template(right))),
                    None => (rest_to_template(rest), None),
                };
                Ok(SubjectTemplate {
                    subject_type: rest_to_template(subject_type),
                    subject_id,
                    subject_relation,
                })
            })
            .transpose()?;

        Ok(Self {
            resource_type: rest_to_template(resource_type),
            resource_id,
            relation,
            subject,
        })
    }

    /// Build a template from the structured rule form, where each component
    /// is its own (possibly empty) template string.
    pub fn from_parts(
        resource_type: &str,
        resource_id: &str,
        relation: &str,
        subject_type: &str,
        subject_id: &str,
        subject_relation: &str,
    ) -> Result<Self, ExprError> {
        let optional = |source: &str| -> Result<Option<TemplateString>, ExprError> {
            if source.is_empty() {
                Ok(None)
            } else {
                Ok(Some(TemplateString::parse(source)?))
            }
        };
        let subject = if subject_type.is_empty() && subject_id.is_empty() {
            None
        } else {
            Some(SubjectTemplate {
                subject_type: TemplateString::parse(subject_type)?,
                subject_id: TemplateString::parse(subject_id)?,
                subject_relation: optional(subject_relation)?,
            })
        };
        Ok(Self {
            resource_type: TemplateString::parse(resource_type)?,
            resource_id: optional(resource_id)?,
            relation: optional(relation)?,
            subject,
        })
    }

    /// Reject `$` outside the resource-ID slot, and optionally require that
    /// the resource ID is exactly the wildcard.
    pub fn validate_wildcard(&self, require_wildcard_id: bool) -> Result<(), ExprError> {
        let mut misplaced = self.resource_type.literal_contains_wildcard();
        if let Some(relation) = &self.relation {
            misplaced |= relation.literal_contains_wildcard();
        }
        if let Some(subject) = &self.subject {
            misplaced |= subject.subject_type.literal_contains_wildcard()
                || subject.subject_id.literal_contains_wildcard()
                || subject
                    .subject_relation
                    .as_ref()
                    .is_some_and(TemplateString::literal_contains_wildcard);
        }
        if misplaced {
            return Err(ExprError::Template(
                "the $ wildcard is only valid in the resource ID slot".into(),
            ));
        }

        let id_is_wildcard = self.resource_id.as_ref().is_some_and(TemplateString::is_wildcard);
        if require_wildcard_id && !id_is_wildcard {
            return Err(ExprError::Template(
                "lookup templates must use $ as the resource ID".into(),
            ));
        }
        if !require_wildcard_id
            && self
                .resource_id
                .as_ref()
                .is_some_and(TemplateString::literal_contains_wildcard)
        {
            return Err(ExprError::Template(
                "the $ wildcard is only valid in prefilter lookup templates".into(),
            ));
        }
        Ok(())
    }

    /// Render a complete relationship tuple. Every component must be present
    /// and non-empty.
    pub fn render_relationship(&self, bindings: &Bindings) -> Result<Relationship, ExprError> {
        let resource_id = self
            .resource_id
            .as_ref()
            .ok_or_else(|| ExprError::Template("relationship template missing resource id".into()))?;
        let relation = self
            .relation
            .as_ref()
            .ok_or_else(|| ExprError::Template("relationship template missing relation".into()))?;
        let subject = self
            .subject
            .as_ref()
            .ok_or_else(|| ExprError::Template("relationship template missing subject".into()))?;

        let rel = Relationship {
            resource_type: self.resource_type.render(bindings)?,
            resource_id: resource_id.render(bindings)?,
            relation: relation.render(bindings)?,
            subject_type: subject.subject_type.render(bindings)?,
            subject_id: subject.subject_id.render(bindings)?,
            subject_relation: subject
                .subject_relation
                .as_ref()
                .map(|t| t.render(bindings))
                .transpose()?
                .filter(|s| !s.is_empty()),
        };
        for (slot, value) in [
            ("resource type", &rel.resource_type),
            ("resource id", &rel.resource_id),
            ("relation", &rel.relation),
            ("subject type", &rel.subject_type),
            ("subject id", &rel.subject_id),
        ] {
            if value.is_empty() {
                return Err(ExprError::Template(format!("{slot} rendered empty")));
            }
        }
        Ok(rel)
    }

    /// Render a permission check. The relation slot carries the permission.
    pub fn render_check(&self, bindings: &Bindings) -> Result<CheckRequest, ExprError> {
        let rel = self.render_relationship(bindings)?;
        Ok(CheckRequest {
            resource_type: rel.resource_type,
            resource_id: rel.resource_id,
            permission: rel.relation,
            subject_type: rel.subject_type,
            subject_id: rel.subject_id,
            subject_relation: rel.subject_relation,
        })
    }

    /// Render a LookupResources request from a wildcard template.
    pub fn render_lookup(&self, bindings: &Bindings) -> Result<LookupRequest, ExprError> {
        if !self.resource_id.as_ref().is_some_and(TemplateString::is_wildcard) {
            return Err(ExprError::Template(
                "lookup templates must use $ as the resource ID".into(),
            ));
        }
        let relation = self
            .relation
            .as_ref()
            .ok_or_else(|| ExprError::Template("lookup template missing permission".into()))?;
        let subject = self
            .subject
            .as_ref()
            .ok_or_else(|| ExprError::Template("lookup template missing subject".into()))?;
        Ok(LookupRequest {
            resource_type: self.resource_type.render(bindings)?,
            permission: relation.render(bindings)?,
            subject_type: subject.subject_type.render(bindings)?,
            subject_id: subject.subject_id.render(bindings)?,
            subject_relation: subject
                .subject_relation
                .as_ref()
                .map(|t| t.render(bindings))
                .transpose()?
                .filter(|s| !s.is_empty()),
        })
    }

    /// Render a relationship filter. Omitted or `*` components match any
    /// value; only the resource type is required.
    pub fn render_filter(&self, bindings: &Bindings) -> Result<RelationshipFilter, ExprError> {
        let optional = |template: &Option<TemplateString>| -> Result<Option<String>, ExprError> {
            match template {
                None => Ok(None),
                Some(t) if t.is_empty() => Ok(None),
                Some(t) => {
                    let rendered = t.render(bindings)?;
                    Ok((!rendered.is_empty() && rendered != MATCH_ANY).then_some(rendered))
                }
            }
        };

        let resource_type = self.resource_type.render(bindings)?;
        if resource_type.is_empty() {
            return Err(ExprError::Template("filter resource type rendered empty".into()));
        }

        let optional_subject_filter = self
            .subject
            .as_ref()
            .map(|subject| -> Result<SubjectFilter, ExprError> {
                Ok(SubjectFilter {
                    subject_type: subject.subject_type.render(bindings)?,
                    optional_subject_id: optional(&Some(subject.subject_id.clone()))?,
                    optional_relation: optional(&subject.subject_relation)?,
                })
            })
            .transpose()?;

        Ok(RelationshipFilter {
            resource_type,
            optional_resource_id: optional(&self.resource_id)?,
            optional_relation: optional(&self.relation)?,
            optional_subject_filter,
        })
    }
}

fn rest_to_template(segments: Vec<Segment>) -> TemplateString {
    TemplateString { segments }
}

/// Scan a source string into literal and `{{ expr }}` segments.
fn scan(source: &str) -> Result<Vec<Segment>, ExprError> {
    let mut segments = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| ExprError::Template(format!("unterminated {{{{ in {source:?}")))?;
        segments.push(Segment::Expr(parse(after[..end].trim())?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

/// Split segments at the first occurrence of `delim` in a literal segment.
/// Delimiters inside `{{ }}` bodies are never structural.
fn split_at(segments: &[Segment], delim: char) -> Option<(Vec<Segment>, Vec<Segment>)> {
    for (i, segment) in segments.iter().enumerate() {
        if let Segment::Literal(text) = segment {
            if let Some(pos) = text.find(delim) {
                let mut left: Vec<Segment> = segments[..i].to_vec();
                if pos > 0 {
                    left.push(Segment::Literal(text[..pos].to_string()));
                }
                let mut right = Vec::new();
                let tail = &text[pos + delim.len_utf8()..];
                if !tail.is_empty() {
                    right.push(Segment::Literal(tail.to_string()));
                }
                right.extend_from_slice(&segments[i + 1..]);
                return Some((left, right));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        Bindings::new()
            .bind("user", json!({"name": "alice"}))
            .bind("name", json!("web-0"))
            .bind("resourceNamespace", json!("default"))
            .bind("namespacedName", json!("default/web-0"))
    }

    #[test]
    fn test_render_full_relationship() {
        let tpl = RelationshipTemplate::parse("pod:{{namespacedName}}#owner@user:{{user.name}}")
            .unwrap();
        let rel = tpl.render_relationship(&bindings()).unwrap();
        assert_eq!(rel.to_string(), "pod:default/web-0#owner@user:alice");
    }

    #[test]
    fn test_render_subject_relation() {
        let tpl =
            RelationshipTemplate::parse("namespace:{{resourceNamespace}}#viewer@group:devs#member")
                .unwrap();
        let rel = tpl.render_relationship(&bindings()).unwrap();
        assert_eq!(rel.subject_relation.as_deref(), Some("member"));
    }

    #[test]
    fn test_structural_chars_inside_expressions() {
        // The ':' and '#' inside the string literal are not structural.
        let tpl = RelationshipTemplate::parse(
            "pod:{{ split(namespacedName, '/')[1] }}#view@user:{{user.name}}",
        )
        .unwrap();
        let rel = tpl.render_relationship(&bindings()).unwrap();
        assert_eq!(rel.resource_id, "web-0");
    }

    #[test]
    fn test_wildcard_lookup_template() {
        let tpl = RelationshipTemplate::parse("pod:$#view@user:{{user.name}}").unwrap();
        tpl.validate_wildcard(true).unwrap();
        let lookup = tpl.render_lookup(&bindings()).unwrap();
        assert_eq!(lookup.resource_type, "pod");
        assert_eq!(lookup.permission, "view");
        assert_eq!(lookup.subject_id, "alice");
    }

    #[test]
    fn test_wildcard_rejected_outside_resource_id() {
        let tpl = RelationshipTemplate::parse("pod:$#view@user:$").unwrap();
        assert!(tpl.validate_wildcard(true).is_err());

        let tpl = RelationshipTemplate::parse("pod:x#view@user:alice").unwrap();
        assert!(tpl.validate_wildcard(true).is_err());

        let tpl = RelationshipTemplate::parse("pod:$#view@user:alice").unwrap();
        assert!(tpl.validate_wildcard(false).is_err());
    }

    #[test]
    fn test_unresolved_variable_fails_render() {
        let tpl = RelationshipTemplate::parse("pod:{{object.metadata.name}}#owner@user:x").unwrap();
        assert!(tpl.render_relationship(&bindings()).is_err());
    }

    #[test]
    fn test_filter_omits_match_any_components() {
        let tpl = RelationshipTemplate::parse("pod:*#*@user:{{user.name}}").unwrap();
        let filter = tpl.render_filter(&bindings()).unwrap();
        assert_eq!(filter.resource_type, "pod");
        assert!(filter.optional_resource_id.is_none());
        assert!(filter.optional_relation.is_none());
        let subject = filter.optional_subject_filter.unwrap();
        assert_eq!(subject.optional_subject_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_structured_parts() {
        let tpl = RelationshipTemplate::from_parts(
            "namespace",
            "{{resourceNamespace}}",
            "creator",
            "user",
            "{{user.name}}",
            "",
        )
        .unwrap();
        let rel = tpl.render_relationship(&bindings()).unwrap();
        assert_eq!(rel.to_string(), "namespace:default#creator@user:alice");
    }
}
