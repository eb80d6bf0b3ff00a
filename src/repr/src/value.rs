// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The recursive value tree carried in document tags and request parameters,
//! and the structured filter predicates evaluated against it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A dynamically typed value.
///
/// This is the free-form payload type for document tags and request
/// parameters. Integers and floats are kept distinct; comparisons between
/// them coerce to `f64`. The serde representation is externally tagged so
/// the binary wire encoding stays positional; the HTTP surface converts
/// through [`json_to_value`]/[`value_to_json`] instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Reports whether this value is "empty" for merge purposes: `Null`,
    /// the empty string, list, or map.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            _ => false,
        }
    }

    /// Looks up a dotted path (`a.b.c`) in this value, descending through
    /// maps.
    pub fn lookup_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(m) => current = m.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A structured filter over a value tree.
///
/// Predicates drive the `when` clauses of flow descriptions: an edge with a
/// predicate only forwards documents whose tags match. The JSON form mirrors
/// the operators: `{"tags.type": {"$eq": 1}}`, combinable with `$and`,
/// `$or` and `$not`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    /// All sub-predicates must match.
    And(Vec<Predicate>),
    /// At least one sub-predicate must match.
    Or(Vec<Predicate>),
    /// The sub-predicate must not match.
    Not(Box<Predicate>),
    /// A comparison of the value at `path` against an operand.
    Cmp {
        path: String,
        op: CmpOp,
        operand: Value,
    },
    /// The value at `path` exists (and is non-null).
    Exists { path: String },
}

/// Comparison operators for [`Predicate::Cmp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$neq")]
    Neq,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$contains")]
    Contains,
}

impl Predicate {
    /// Parses the JSON filter syntax.
    ///
    /// The outer object maps dotted paths to `{operator: operand}` objects;
    /// the reserved keys `$and`, `$or` and `$not` introduce combinators.
    /// Multiple entries in one object are an implicit `$and`.
    pub fn from_json(json: &serde_json::Value) -> Result<Predicate, String> {
        let obj = json
            .as_object()
            .ok_or_else(|| format!("filter must be an object, got {json}"))?;
        let mut terms = Vec::with_capacity(obj.len());
        for (key, val) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let arr = val
                        .as_array()
                        .ok_or_else(|| format!("{key} expects an array"))?;
                    let subs = arr
                        .iter()
                        .map(Predicate::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    terms.push(if key == "$and" {
                        Predicate::And(subs)
                    } else {
                        Predicate::Or(subs)
                    });
                }
                "$not" => terms.push(Predicate::Not(Box::new(Predicate::from_json(val)?))),
                path => {
                    let ops = val
                        .as_object()
                        .ok_or_else(|| format!("comparison for {path} must be an object"))?;
                    for (op_name, operand) in ops {
                        if op_name == "$exists" {
                            let positive = operand.as_bool().unwrap_or(true);
                            let exists = Predicate::Exists { path: path.into() };
                            terms.push(if positive {
                                exists
                            } else {
                                Predicate::Not(Box::new(exists))
                            });
                            continue;
                        }
                        let op = match op_name.as_str() {
                            "$eq" => CmpOp::Eq,
                            "$neq" => CmpOp::Neq,
                            "$gt" => CmpOp::Gt,
                            "$gte" => CmpOp::Gte,
                            "$lt" => CmpOp::Lt,
                            "$lte" => CmpOp::Lte,
                            "$contains" => CmpOp::Contains,
                            other => return Err(format!("unknown filter operator {other}")),
                        };
                        terms.push(Predicate::Cmp {
                            path: path.into(),
                            op,
                            operand: json_to_value(operand),
                        });
                    }
                }
            }
        }
        match terms.len() {
            0 => Err("empty filter".into()),
            1 => Ok(terms.pop().expect("len checked")),
            _ => Ok(Predicate::And(terms)),
        }
    }

    /// Evaluates the predicate against a value tree (typically the map of a
    /// document's tags wrapped in [`Value::Map`]).
    pub fn matches(&self, root: &Value) -> bool {
        match self {
            Predicate::And(subs) => subs.iter().all(|p| p.matches(root)),
            Predicate::Or(subs) => subs.iter().any(|p| p.matches(root)),
            Predicate::Not(sub) => !sub.matches(root),
            Predicate::Exists { path } => {
                matches!(root.lookup_path(path), Some(v) if *v != Value::Null)
            }
            Predicate::Cmp { path, op, operand } => {
                let Some(actual) = root.lookup_path(path) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => value_eq(actual, operand),
                    CmpOp::Neq => !value_eq(actual, operand),
                    CmpOp::Gt => value_cmp(actual, operand).is_some_and(|o| o.is_gt()),
                    CmpOp::Gte => value_cmp(actual, operand).is_some_and(|o| o.is_ge()),
                    CmpOp::Lt => value_cmp(actual, operand).is_some_and(|o| o.is_lt()),
                    CmpOp::Lte => value_cmp(actual, operand).is_some_and(|o| o.is_le()),
                    CmpOp::Contains => match (actual, operand) {
                        (Value::Str(s), Value::Str(needle)) => s.contains(needle.as_str()),
                        (Value::List(l), needle) => l.iter().any(|v| value_eq(v, needle)),
                        _ => false,
                    },
                }
            }
        }
    }
}

/// Equality with numeric coercion between `Int` and `Float`.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for comparable values: numbers (coerced) and strings.
fn value_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
    }
}

/// Converts a `serde_json::Value` into a [`Value`].
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(a) => Value::List(a.iter().map(json_to_value).collect()),
        serde_json::Value::Object(o) => Value::Map(
            o.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Converts a [`Value`] into a `serde_json::Value`. Bytes are rendered as an
/// array of numbers, which is lossy but only used on the HTTP surface.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::from(b.clone()),
        Value::List(l) => serde_json::Value::Array(l.iter().map(value_to_json).collect()),
        Value::Map(m) => serde_json::Value::Object(
            m.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect(),
        ),
    }
}
