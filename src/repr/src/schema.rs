// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Endpoint schemas and the loose compatibility check applied along flow
//! edges at start-up.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Tensor,
    /// Nested document list (chunks/matches style).
    Docs,
    /// Anything; compatible with every type.
    Any,
}

impl FieldType {
    fn accepts(self, producer: FieldType) -> bool {
        self == FieldType::Any || producer == FieldType::Any || self == producer
    }
}

/// A structural record schema for documents on one side of an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Field name → type.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    /// Fields a consumer requires to be present.
    #[serde(default)]
    pub required: BTreeSet<String>,
}

impl RecordSchema {
    /// The schema accepting anything. Executors that do not declare schemas
    /// get this on both sides.
    pub fn any() -> RecordSchema {
        RecordSchema::default()
    }

    /// The loose subtype check: `self` (a consumer's request schema) accepts
    /// `producer` (an upstream response schema) when they match exactly, or
    /// when every required field of `self` is present in `producer` with a
    /// compatible type. An empty producer schema means "undeclared" and is
    /// accepted.
    pub fn accepts(&self, producer: &RecordSchema) -> bool {
        if self == producer || producer.fields.is_empty() {
            return true;
        }
        self.required.iter().all(|name| {
            match (self.fields.get(name), producer.fields.get(name)) {
                (Some(want), Some(have)) => want.accepts(*have),
                (None, Some(_)) => true,
                _ => false,
            }
        })
    }
}

/// Dynamic batching configuration declared on an endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once this many documents are pending.
    pub preferred_batch_size: usize,
    /// Flush this long after the first parked request of a batch.
    #[serde(with = "crate::schema::duration_millis")]
    pub timeout: Duration,
}

/// Everything the gateway's discovery surface exposes about one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSchema {
    #[serde(default)]
    pub request: RecordSchema,
    #[serde(default)]
    pub response: RecordSchema,
    /// Whether invocations mutate executor state (and must be replicated in
    /// a stateful deployment).
    #[serde(default)]
    pub write_op: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchConfig>,
}

/// Endpoint name → schema, for one node.
pub type SchemaMap = BTreeMap<String, EndpointSchema>;

/// Serde helper: durations as integer milliseconds on the wire.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &[(&str, FieldType)], required: &[&str]) -> RecordSchema {
        RecordSchema {
            fields: fields.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            required: required.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[test]
    fn exact_match_accepts() {
        let s = schema(&[("text", FieldType::Str)], &["text"]);
        assert!(s.accepts(&s.clone()));
    }

    #[test]
    fn structural_match_checks_required_fields() {
        let consumer = schema(&[("text", FieldType::Str)], &["text"]);
        let producer = schema(
            &[("text", FieldType::Str), ("extra", FieldType::Int)],
            &[],
        );
        assert!(consumer.accepts(&producer));

        let producer = schema(&[("other", FieldType::Str)], &[]);
        assert!(!consumer.accepts(&producer));

        let producer = schema(&[("text", FieldType::Int)], &[]);
        assert!(!consumer.accepts(&producer));
    }

    #[test]
    fn undeclared_producer_accepted() {
        let consumer = schema(&[("text", FieldType::Str)], &["text"]);
        assert!(consumer.accepts(&RecordSchema::any()));
    }

    #[test]
    fn any_type_is_wildcard() {
        let consumer = schema(&[("embedding", FieldType::Any)], &["embedding"]);
        let producer = schema(&[("embedding", FieldType::Tensor)], &[]);
        assert!(consumer.accepts(&producer));
    }
}
