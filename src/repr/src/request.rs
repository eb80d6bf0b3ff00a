// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Requests, headers, and the routes table.
//!
//! A [`DataRequest`] is the unit of routing: a single client call yields one
//! or more requests, each of which travels the compiled graph independently.
//! The same type serves as response — nodes transform the request in place
//! and pass it on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocBatch;
use crate::error::Error;
use crate::value::Value;

/// The endpoint name of the fallback handler every executor may register.
pub const DEFAULT_ENDPOINT: &str = "__default__";

/// The synthetic health-probe endpoint present on every executor.
pub const DRY_RUN_ENDPOINT: &str = "__dry_run__";

/// The parameter key under which per-executor handler results accumulate.
pub const RESULTS_KEY: &str = "__results__";

/// A request identifier. 16 random bytes, rendered as a simple uuid.
pub type RequestId = Uuid;

/// What downstream nodes do once a node in the graph has failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStrategy {
    /// Abort the request at the first failure (default).
    #[default]
    ThrowEarly,
    /// Downstream nodes receive the request but skip their handler; merging
    /// still runs.
    SkipHandle,
    /// Downstream nodes execute normally on whatever batch the failed node
    /// produced.
    SkipExecutor,
}

/// Header metadata stamped by the gateway and read by heads and workers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// The endpoint the client invoked; workers fall back to this when the
    /// request's own endpoint is empty.
    pub exec_endpoint: String,
    /// Regex over node names; nodes not matching forward the request
    /// unprocessed.
    pub target_executor: Option<String>,
    /// Opaque tracing context, propagated verbatim.
    pub tracing: Option<String>,
    /// The flow's error strategy.
    pub on_error: ErrorStrategy,
}

/// Per-node processing status in the routes table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStatus {
    /// The node has seen the request but not resolved it.
    Pending,
    Succeeded,
    Failed,
    /// The node received an already-failed request and propagated it.
    Chained,
}

/// One entry of the per-response audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub node: String,
    pub status: RouteStatus,
    #[serde(default)]
    pub error: Option<Error>,
}

/// A self-contained routable message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub id: RequestId,
    /// Target endpoint name, e.g. `/search`.
    pub endpoint: String,
    pub headers: Headers,
    /// Free-form, recursively structured parameters. A key equal to an
    /// executor name scopes its sub-map to that executor.
    pub parameters: BTreeMap<String, Value>,
    /// Audit log of every node that processed this request.
    pub routes: Vec<Route>,
    /// The payload.
    pub docs: DocBatch,
}

impl DataRequest {
    /// Creates a request for `endpoint` carrying `docs`, with a fresh id.
    pub fn new(endpoint: impl Into<String>, docs: DocBatch) -> DataRequest {
        let endpoint = endpoint.into();
        DataRequest {
            id: Uuid::new_v4(),
            headers: Headers {
                exec_endpoint: endpoint.clone(),
                ..Default::default()
            },
            endpoint,
            parameters: BTreeMap::new(),
            routes: Vec::new(),
            docs,
        }
    }

    /// The effective endpoint: the request's own, falling back to the
    /// header's exec endpoint.
    pub fn effective_endpoint(&self) -> &str {
        if self.endpoint.is_empty() {
            &self.headers.exec_endpoint
        } else {
            &self.endpoint
        }
    }

    /// Appends a `Pending` route entry for `node` and returns its index.
    pub fn begin_route(&mut self, node: &str) -> usize {
        self.routes.push(Route {
            node: node.to_string(),
            status: RouteStatus::Pending,
            error: None,
        });
        self.routes.len() - 1
    }

    /// Resolves the route entry at `index`.
    pub fn end_route(&mut self, index: usize, status: RouteStatus, error: Option<Error>) {
        if let Some(route) = self.routes.get_mut(index) {
            route.status = status;
            route.error = error;
        }
    }

    /// The first failed route entry, if any. `Chained` entries do not count:
    /// only the originating failure matters.
    pub fn first_failure(&self) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.status == RouteStatus::Failed)
    }

    /// Computes the parameters visible to `executor`: the top-level map with
    /// any `parameters[executor]` sub-map merged over it. Sub-maps scoped to
    /// other executors are stripped.
    pub fn parameters_for(&self, executor: &str, known_executors: &[String]) -> BTreeMap<String, Value> {
        let mut params: BTreeMap<String, Value> = self
            .parameters
            .iter()
            .filter(|(k, _)| {
                k.as_str() != RESULTS_KEY && !known_executors.iter().any(|e| e == *k)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(Value::Map(specific)) = self.parameters.get(executor) {
            for (k, v) in specific {
                params.insert(k.clone(), v.clone());
            }
        }
        params
    }

    /// Records a handler-returned result map under
    /// `parameters[__results__][executor]`.
    pub fn record_result(&mut self, executor: &str, result: BTreeMap<String, Value>) {
        let results = self
            .parameters
            .entry(RESULTS_KEY.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if let Value::Map(map) = results {
            map.insert(executor.to_string(), Value::Map(result));
        }
    }

    /// The accumulated `__results__` map, if any handler returned one.
    pub fn results(&self) -> Option<&BTreeMap<String, Value>> {
        match self.parameters.get(RESULTS_KEY) {
            Some(Value::Map(map)) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_for_merges_specific_submap() {
        let mut req = DataRequest::new("/foo", DocBatch::empty());
        req.parameters.insert("limit".into(), Value::Int(10));
        req.parameters.insert(
            "indexer".into(),
            Value::Map(BTreeMap::from([("limit".into(), Value::Int(3))])),
        );
        req.parameters.insert(
            "encoder".into(),
            Value::Map(BTreeMap::from([("dim".into(), Value::Int(128))])),
        );
        let known = vec!["indexer".to_string(), "encoder".to_string()];

        let params = req.parameters_for("indexer", &known);
        assert_eq!(params.get("limit"), Some(&Value::Int(3)));
        assert!(!params.contains_key("encoder"));

        let params = req.parameters_for("ranker", &known);
        assert_eq!(params.get("limit"), Some(&Value::Int(10)));
    }

    #[test]
    fn routes_lifecycle() {
        let mut req = DataRequest::new("/foo", DocBatch::empty());
        let i = req.begin_route("worker0");
        assert_eq!(req.routes[i].status, RouteStatus::Pending);
        req.end_route(
            i,
            RouteStatus::Failed,
            Some(Error::internal("worker0", "boom")),
        );
        assert_eq!(req.first_failure().unwrap().node, "worker0");
    }

    #[test]
    fn results_accumulate_per_executor() {
        let mut req = DataRequest::new("/foo", DocBatch::empty());
        req.record_result("a", BTreeMap::from([("n".into(), Value::Int(1))]));
        req.record_result("b", BTreeMap::from([("n".into(), Value::Int(2))]));
        let results = req.results().unwrap();
        assert_eq!(results.len(), 2);
    }
}
