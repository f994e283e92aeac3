//! Predicate trees for route matching
//!
//! Route configuration arrives as a JSON-shaped tree of comparisons over
//! dotted paths into the serialized message (`topic`, `payload.total`,
//! `headers.tenant`, ...), composed with `and`/`or`/`not`. The tree is
//! deserialized into [`Condition`] and compiled once at route-add time into
//! [`CompiledCondition`]; regexes are compiled here, never per message.

use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::BusError;

/// Look up a dotted path inside a JSON document. Array segments may be
/// numeric indices. Returns `None` when any segment is missing.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for seg in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A predicate tree as it appears in route configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Condition {
    Eq { path: String, value: Value },
    Neq { path: String, value: Value },
    Gt { path: String, value: Value },
    Gte { path: String, value: Value },
    Lt { path: String, value: Value },
    Lte { path: String, value: Value },
    In { path: String, values: Vec<Value> },
    Regex { path: String, pattern: String },
    And { args: Vec<Condition> },
    Or { args: Vec<Condition> },
    Not { arg: Box<Condition> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// The evaluation-ready form of a [`Condition`].
#[derive(Debug, Clone)]
pub enum CompiledCondition {
    Cmp {
        op: CmpOp,
        path: String,
        value: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
    },
    Regex {
        path: String,
        regex: Regex,
    },
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
}

impl CompiledCondition {
    /// Compile a condition tree. The only fallible leaf is `regex`; a bad
    /// pattern surfaces as `RouteInvalid` from `add_route`/`update_route`.
    pub fn compile(spec: &Condition) -> Result<Self, BusError> {
        let cmp = |op: CmpOp, path: &String, value: &Value| CompiledCondition::Cmp {
            op,
            path: path.clone(),
            value: value.clone(),
        };

        Ok(match spec {
            Condition::Eq { path, value } => cmp(CmpOp::Eq, path, value),
            Condition::Neq { path, value } => cmp(CmpOp::Neq, path, value),
            Condition::Gt { path, value } => cmp(CmpOp::Gt, path, value),
            Condition::Gte { path, value } => cmp(CmpOp::Gte, path, value),
            Condition::Lt { path, value } => cmp(CmpOp::Lt, path, value),
            Condition::Lte { path, value } => cmp(CmpOp::Lte, path, value),
            Condition::In { path, values } => CompiledCondition::In {
                path: path.clone(),
                values: values.clone(),
            },
            Condition::Regex { path, pattern } => CompiledCondition::Regex {
                path: path.clone(),
                regex: Regex::new(pattern).map_err(|e| BusError::RouteInvalid {
                    reason: format!("bad regex `{pattern}`: {e}"),
                })?,
            },
            Condition::And { args } => {
                CompiledCondition::And(Self::compile_all(args)?)
            }
            Condition::Or { args } => CompiledCondition::Or(Self::compile_all(args)?),
            Condition::Not { arg } => CompiledCondition::Not(Box::new(Self::compile(arg)?)),
        })
    }

    fn compile_all(specs: &[Condition]) -> Result<Vec<Self>, BusError> {
        specs.iter().map(Self::compile).collect()
    }

    /// Evaluate against a serialized message. A missing path fails every
    /// leaf comparison, including `neq`.
    pub fn evaluate(&self, doc: &Value) -> bool {
        match self {
            CompiledCondition::Cmp { op, path, value } => {
                let Some(actual) = lookup(doc, path) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => values_equal(actual, value),
                    CmpOp::Neq => !values_equal(actual, value),
                    CmpOp::Gt => compare(actual, value) == Some(Ordering::Greater),
                    CmpOp::Gte => matches!(
                        compare(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CmpOp::Lt => compare(actual, value) == Some(Ordering::Less),
                    CmpOp::Lte => matches!(
                        compare(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
            CompiledCondition::In { path, values } => lookup(doc, path)
                .map(|actual| values.iter().any(|v| values_equal(actual, v)))
                .unwrap_or(false),
            CompiledCondition::Regex { path, regex } => lookup(doc, path)
                .and_then(Value::as_str)
                .map(|s| regex.is_match(s))
                .unwrap_or(false),
            CompiledCondition::And(args) => args.iter().all(|c| c.evaluate(doc)),
            CompiledCondition::Or(args) => args.iter().any(|c| c.evaluate(doc)),
            CompiledCondition::Not(arg) => !arg.evaluate(doc),
        }
    }
}

/// Ordering between two JSON values: numbers compare numerically (integer
/// and float representations agree), strings lexicographically. Anything
/// else is unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Equality that treats `100` and `100.0` as the same number; everything
/// else falls back to structural equality.
fn values_equal(a: &Value, b: &Value) -> bool {
    match compare(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}
