//! Expression engine
//!
//! Two syntaxes share one evaluator: a boolean predicate language used by
//! rule `if` conditions, and `{{ expr }}` string templates used to render
//! relationship tuples, preconditions and lookup requests.
//!
//! Expressions evaluate against JSON values. The variables bound for every
//! request are `request`, `user`, `object`, `name`, `resourceNamespace`,
//! `namespacedName`, `headers` and `body`; prefilter extractors additionally
//! see `resourceId`.

use std::collections::BTreeMap;

use thiserror::Error;

mod eval;
mod parser;
mod template;

pub use eval::evaluate;
pub use parser::{parse, Expr};
pub use template::{RelationshipTemplate, SubjectTemplate, TemplateString, WILDCARD_ID};

/// Runtime values are JSON values.
pub type Value = serde_json::Value;

/// Expression errors. Parse errors surface at rule-load time; evaluation
/// errors surface per request as authorization denials.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("no such field {0:?}")]
    NoSuchField(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("template error: {0}")]
    Template(String),
}

/// Variable bindings for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    vars: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Parse and evaluate a predicate, requiring a boolean result.
pub fn evaluate_predicate(source: &str, bindings: &Bindings) -> Result<bool, ExprError> {
    let expr = parse(source)?;
    match evaluate(&expr, bindings)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "predicate {source:?} evaluated to non-boolean {other}"
        ))),
    }
}
