//! Evaluator shared by predicates and templates.

use serde_json::Value;

use super::parser::{BinaryOp, Expr};
use super::{Bindings, ExprError};

/// Evaluate an expression against the given bindings.
pub fn evaluate(expr: &Expr, bindings: &Bindings) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(evaluate(item, bindings)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Member(receiver, field) => {
            let value = evaluate(receiver, bindings)?;
            match value {
                Value::Object(map) => map
                    .get(field)
                    .cloned()
                    .ok_or_else(|| ExprError::NoSuchField(field.clone())),
                other => Err(ExprError::Type(format!(
                    "cannot access field {field:?} on {}",
                    type_name(&other)
                ))),
            }
        }
        Expr::Index(receiver, index) => {
            let value = evaluate(receiver, bindings)?;
            let index = evaluate(index, bindings)?;
            match (&value, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n.as_f64().unwrap_or(-1.0);
                    if i < 0.0 || i.fract() != 0.0 {
                        return Err(ExprError::Type(format!("invalid list index {n}")));
                    }
                    items
                        .get(i as usize)
                        .cloned()
                        .ok_or_else(|| ExprError::Type(format!("list index {n} out of range")))
                }
                (Value::Object(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ExprError::NoSuchField(key.clone())),
                _ => Err(ExprError::Type(format!(
                    "cannot index {} with {}",
                    type_name(&value),
                    type_name(&index)
                ))),
            }
        }
        Expr::Not(inner) => match evaluate(inner, bindings)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Type(format!(
                "cannot negate {}",
                type_name(&other)
            ))),
        },
        Expr::Binary(op, left, right) => evaluate_binary(*op, left, right, bindings),
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, bindings)?);
            }
            call_function(name, &values)
        }
        Expr::Method(receiver, name, args) => {
            let receiver = evaluate(receiver, bindings)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, bindings)?);
            }
            call_method(&receiver, name, &values)
        }
    }
}

fn evaluate_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    bindings: &Bindings,
) -> Result<Value, ExprError> {
    // && and || short-circuit before the right side is touched.
    match op {
        BinaryOp::And => {
            return match evaluate(left, bindings)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match evaluate(right, bindings)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(non_boolean_operand("&&", &other)),
                },
                other => Err(non_boolean_operand("&&", &other)),
            };
        }
        BinaryOp::Or => {
            return match evaluate(left, bindings)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match evaluate(right, bindings)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(non_boolean_operand("||", &other)),
                },
                other => Err(non_boolean_operand("||", &other)),
            };
        }
        _ => {}
    }

    let left = evaluate(left, bindings)?;
    let right = evaluate(right, bindings)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(value_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!value_eq(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => match &right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| value_eq(i, &left)))),
            Value::Object(map) => match &left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                other => Err(ExprError::Type(format!(
                    "map membership requires a string key, got {}",
                    type_name(other)
                ))),
            },
            Value::String(haystack) => match &left {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                other => Err(ExprError::Type(format!(
                    "string membership requires a string, got {}",
                    type_name(other)
                ))),
            },
            other => Err(ExprError::Type(format!(
                "`in` requires a list, map or string on the right, got {}",
                type_name(other)
            ))),
        },
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn non_boolean_operand(op: &str, value: &Value) -> ExprError {
    ExprError::Type(format!("{op} requires boolean operands, got {}", type_name(value)))
}

/// Structural equality with numeric coercion (1 == 1.0).
pub(crate) fn value_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| value_eq(l, r))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r)
                .ok_or_else(|| ExprError::Type("cannot order NaN".into()))
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(ExprError::Type(format!(
            "cannot order {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "split" => match args {
            [Value::String(s), Value::String(sep)] => Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            _ => Err(ExprError::Type("split(string, string) expected".into())),
        },
        "size" => match args {
            [Value::String(s)] => Ok(serde_json::json!(s.chars().count())),
            [Value::Array(items)] => Ok(serde_json::json!(items.len())),
            [Value::Object(map)] => Ok(serde_json::json!(map.len())),
            _ => Err(ExprError::Type("size(string|list|map) expected".into())),
        },
        "string" => match args {
            [value] => Ok(Value::String(stringify(value)?)),
            _ => Err(ExprError::Type("string(value) expected".into())),
        },
        "has" => match args {
            [Value::Object(map), Value::String(key)] => Ok(Value::Bool(map.contains_key(key))),
            _ => Err(ExprError::Type("has(map, string) expected".into())),
        },
        _ => Err(ExprError::Type(format!("unknown function {name:?}"))),
    }
}

fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (receiver, name, args) {
        (Value::String(s), "startsWith", [Value::String(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        (Value::String(s), "endsWith", [Value::String(suffix)]) => {
            Ok(Value::Bool(s.ends_with(suffix.as_str())))
        }
        (Value::String(s), "contains", [Value::String(needle)]) => {
            Ok(Value::Bool(s.contains(needle.as_str())))
        }
        (Value::String(s), "matches", [Value::String(pattern)]) => {
            let re = regex_lite::Regex::new(pattern)
                .map_err(|e| ExprError::Type(format!("invalid pattern {pattern:?}: {e}")))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        (Value::Array(items), "contains", [needle]) => {
            Ok(Value::Bool(items.iter().any(|i| value_eq(i, needle))))
        }
        _ => Err(ExprError::Type(format!(
            "unknown method {name:?} on {}",
            type_name(receiver)
        ))),
    }
}

/// Render a value as a template fragment. Only scalars stringify;
/// structured values in templates are almost always a rule bug.
pub(crate) fn stringify(value: &Value) -> Result<String, ExprError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ExprError::Type(format!(
            "cannot render {} into a template",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
