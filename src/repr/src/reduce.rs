// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Id-keyed merging of document batches.
//!
//! When a request fans out (ALL polling across shards, or multiple `needs`
//! converging at one node) the branch responses must be folded back into a
//! single batch. The fold is keyed on document id, never on position:
//!
//!  * a document present in only one branch is appended;
//!  * for a document present in several branches, scalar fields take the
//!    later branch's value when it is non-empty, sub-collections are
//!    themselves reduced id-keyed, and tag maps are unioned with the later
//!    branch winning on key conflicts.
//!
//! Reducing N identical batches therefore yields the original batch
//! unchanged, and reduction order only matters where branches genuinely
//! disagree on a scalar.

use std::collections::btree_map::Entry;
use std::collections::HashMap;

use crate::document::{DocBatch, Document};
use crate::value::Value;

/// Merges `right` into `left` field by field. `left` is the earlier writer.
pub fn merge_document(left: &mut Document, right: Document) {
    // The id is the merge key and never updated.
    if !right.content.is_empty() {
        left.content = right.content;
    }
    reduce_into(&mut left.chunks, right.chunks);
    reduce_into(&mut left.matches, right.matches);
    for (key, right_value) in right.tags {
        match left.tags.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(right_value);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), right_value) {
                // List-valued tags concatenate across branches; everything
                // else takes the later writer's value.
                (Value::List(l), Value::List(r)) => l.extend(r),
                (current, value) => *current = value,
            },
        }
    }
}

/// Reduces `right` into the document list `left`, id-keyed.
fn reduce_into(left: &mut Vec<Document>, right: Vec<Document>) {
    if right.is_empty() {
        return;
    }
    let mut index: HashMap<String, usize> = left
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.clone(), i))
        .collect();
    for doc in right {
        match index.get(&doc.id) {
            Some(&i) => merge_document(&mut left[i], doc),
            None => {
                index.insert(doc.id.clone(), left.len());
                left.push(doc);
            }
        }
    }
}

/// Folds a sequence of batches into one, left to right.
///
/// First-occurrence order of ids is preserved: a document keeps the position
/// at which any branch first produced it.
pub fn reduce(batches: Vec<DocBatch>) -> DocBatch {
    let mut iter = batches.into_iter();
    let Some(first) = iter.next() else {
        return DocBatch::empty();
    };
    let mut acc = first.0;
    for batch in iter {
        reduce_into(&mut acc, batch.0);
    }
    DocBatch(acc)
}

/// Concatenates batches without any merging.
///
/// Used when reduction is disabled on a deployment: downstream sees the full
/// multiplicity, duplicate ids included, without truncation.
pub fn concat(batches: Vec<DocBatch>) -> DocBatch {
    let mut acc = DocBatch::empty();
    for batch in batches {
        acc.extend(batch);
    }
    acc
}

/// Folds the responses of a fan-out (shards, or converging `needs` branches)
/// into one response.
///
/// Document batches are id-keyed reduced (or concatenated when
/// `disable_reduce` is set), route entries of every branch are unioned (first
/// entry per node wins), and accumulated handler results are merged across
/// branches.
pub fn reduce_requests(
    responses: Vec<crate::request::DataRequest>,
    disable_reduce: bool,
) -> Option<crate::request::DataRequest> {
    use crate::request::RESULTS_KEY;

    let mut iter = responses.into_iter();
    let mut base = iter.next()?;
    let mut batches = vec![std::mem::take(&mut base.docs)];
    for resp in iter {
        batches.push(resp.docs);
        for route in resp.routes {
            if !base.routes.iter().any(|r| r.node == route.node) {
                base.routes.push(route);
            }
        }
        if let Some(Value::Map(results)) = resp.parameters.get(RESULTS_KEY) {
            for (executor, value) in results.clone() {
                let entry = base
                    .parameters
                    .entry(RESULTS_KEY.to_string())
                    .or_insert_with(|| Value::Map(Default::default()));
                if let Value::Map(map) = entry {
                    map.entry(executor).or_insert(value);
                }
            }
        }
    }
    base.docs = if disable_reduce {
        concat(batches)
    } else {
        reduce(batches)
    };
    Some(base)
}

#[cfg(test)]
mod tests {
    use crate::document::Content;
    use crate::value::Value;

    use super::*;

    fn doc(id: &str, text: &str) -> Document {
        Document::text(id, text)
    }

    #[test]
    fn disjoint_ids_concatenate() {
        let merged = reduce(vec![
            DocBatch(vec![doc("a", "1")]),
            DocBatch(vec![doc("b", "2")]),
        ]);
        assert_eq!(merged.ids(), vec!["a", "b"]);
    }

    #[test]
    fn later_writer_wins_on_scalars() {
        let merged = reduce(vec![
            DocBatch(vec![doc("a", "old")]),
            DocBatch(vec![doc("a", "new")]),
        ]);
        assert_eq!(merged[0].text_content(), Some("new"));
    }

    #[test]
    fn empty_scalar_does_not_clobber() {
        let merged = reduce(vec![
            DocBatch(vec![doc("a", "kept")]),
            DocBatch(vec![Document::with_id("a")]),
        ]);
        assert_eq!(merged[0].text_content(), Some("kept"));
    }

    #[test]
    fn sub_collections_union() {
        let mut left = Document::with_id("a");
        left.chunks.push(doc("c1", "left"));
        let mut right = Document::with_id("a");
        right.chunks.push(doc("c2", "right"));
        let merged = reduce(vec![DocBatch(vec![left]), DocBatch(vec![right])]);
        assert_eq!(
            merged[0].chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );
    }

    #[test]
    fn list_tags_concatenate_across_branches() {
        let mut left = Document::with_id("1");
        left.tags.insert("seen".into(), Value::List(vec![Value::Int(0)]));
        let mut right = Document::with_id("1");
        right.tags.insert("seen".into(), Value::List(vec![Value::Int(1)]));
        let merged = reduce(vec![DocBatch(vec![left]), DocBatch(vec![right])]);
        assert_eq!(
            merged[0].tags["seen"],
            Value::List(vec![Value::Int(0), Value::Int(1)])
        );
    }

    #[test]
    fn tags_union_with_later_priority() {
        let mut left = Document::with_id("a");
        left.tags.insert("x".into(), Value::Int(1));
        left.tags.insert("y".into(), Value::Int(1));
        let mut right = Document::with_id("a");
        right.tags.insert("y".into(), Value::Int(2));
        right.tags.insert("z".into(), Value::Int(3));
        let merged = reduce(vec![DocBatch(vec![left]), DocBatch(vec![right])]);
        assert_eq!(merged[0].tags["x"], Value::Int(1));
        assert_eq!(merged[0].tags["y"], Value::Int(2));
        assert_eq!(merged[0].tags["z"], Value::Int(3));
    }

    #[test]
    fn reduce_is_idempotent_on_identical_batches() {
        let mut d = doc("a", "hello");
        d.chunks.push(doc("c", "chunk"));
        d.content = Content::Text("hello".into());
        let batch = DocBatch(vec![d]);
        let merged = reduce(vec![batch.clone(), batch.clone(), batch.clone()]);
        assert_eq!(merged, batch);
    }

    #[test]
    fn concat_keeps_duplicates() {
        let merged = concat(vec![
            DocBatch(vec![doc("a", "1")]),
            DocBatch(vec![doc("a", "2")]),
        ]);
        assert_eq!(merged.ids(), vec!["a", "a"]);
    }
}
