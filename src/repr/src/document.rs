// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Documents and document batches.
//!
//! A [`Document`] is the unit of user payload. The runtime never interprets
//! its content; it carries, filters, merges, and orders documents, nothing
//! more.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// The payload of a document. Opaque to the runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Content {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    /// A dense tensor in row-major order.
    Tensor { shape: Vec<usize>, data: Vec<f32> },
}

impl Content {
    /// Reports whether the content carries no data.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Empty => true,
            Content::Text(t) => t.is_empty(),
            Content::Bytes(b) => b.is_empty(),
            Content::Tensor { data, .. } => data.is_empty(),
        }
    }
}

/// A single typed record flowing through the graph.
///
/// Fields are always serialized, even when empty: the binary wire encoding
/// is positional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier; merging across branches is keyed on it.
    pub id: String,
    /// The user payload.
    #[serde(default)]
    pub content: Content,
    /// Nested sub-documents.
    #[serde(default)]
    pub chunks: Vec<Document>,
    /// Nested result documents.
    #[serde(default)]
    pub matches: Vec<Document>,
    /// Free-form metadata; filter predicates evaluate against this map.
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
}

impl Document {
    /// Creates an empty document with a fresh random id.
    pub fn new() -> Document {
        Document {
            id: Uuid::new_v4().simple().to_string(),
            ..Default::default()
        }
    }

    /// Creates a document with the given id.
    pub fn with_id(id: impl Into<String>) -> Document {
        Document {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Creates a text document with the given id.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Document {
        Document {
            id: id.into(),
            content: Content::Text(text.into()),
            ..Default::default()
        }
    }

    /// Returns the text content, if any.
    pub fn text_content(&self) -> Option<&str> {
        match &self.content {
            Content::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The tags map as a [`Value`] tree rooted at `tags`, for predicate
    /// evaluation.
    pub fn tag_root(&self) -> Value {
        let mut root = BTreeMap::new();
        root.insert("tags".to_string(), Value::Map(self.tags.clone()));
        Value::Map(root)
    }
}

/// An ordered batch of documents.
///
/// Every component preserves the order of documents within a batch; only the
/// id-keyed [`reduce`](crate::reduce) across parallel branches is
/// order-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocBatch(pub Vec<Document>);

impl DocBatch {
    /// The empty batch.
    pub fn empty() -> DocBatch {
        DocBatch(Vec::new())
    }

    /// Appends all documents of `other`.
    pub fn extend(&mut self, other: DocBatch) {
        self.0.extend(other.0);
    }

    /// Splits off the first `n` documents into a new batch.
    ///
    /// Panics if fewer than `n` documents remain; batch-queue slicing
    /// guarantees the handler returned a correctly sized batch before any
    /// slicing happens.
    pub fn split_off_front(&mut self, n: usize) -> DocBatch {
        let rest = self.0.split_off(n);
        DocBatch(std::mem::replace(&mut self.0, rest))
    }

    /// Keeps only documents matching the predicate, preserving order.
    pub fn filtered(&self, predicate: &crate::value::Predicate) -> DocBatch {
        DocBatch(
            self.0
                .iter()
                .filter(|doc| predicate.matches(&doc.tag_root()))
                .cloned()
                .collect(),
        )
    }

    /// The ids of the documents, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.id.as_str()).collect()
    }
}

impl Deref for DocBatch {
    type Target = Vec<Document>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DocBatch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<Document> for DocBatch {
    fn from_iter<I: IntoIterator<Item = Document>>(iter: I) -> Self {
        DocBatch(iter.into_iter().collect())
    }
}

impl IntoIterator for DocBatch {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Predicate;

    #[test]
    fn split_off_front_preserves_order() {
        let mut batch: DocBatch = ["a", "b", "c", "d"]
            .iter()
            .map(|id| Document::with_id(*id))
            .collect();
        let front = batch.split_off_front(2);
        assert_eq!(front.ids(), vec!["a", "b"]);
        assert_eq!(batch.ids(), vec!["c", "d"]);
    }

    #[test]
    fn filtered_evaluates_tags() {
        let mut doc_a = Document::with_id("a");
        doc_a.tags.insert("type".into(), Value::Int(1));
        let mut doc_b = Document::with_id("b");
        doc_b.tags.insert("type".into(), Value::Int(2));
        let batch = DocBatch(vec![doc_a, doc_b]);
        let p = Predicate::from_json(&serde_json::json!({"tags.type": {"$eq": 1}})).unwrap();
        assert_eq!(batch.filtered(&p).ids(), vec!["a"]);
    }
}
