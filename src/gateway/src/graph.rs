// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Driving one request through the compiled graph.
//!
//! The driver walks the graph in topological order, accumulating the parts
//! converging on each node, merging them with the node's reduce policy,
//! filtering documents against the node's `when` predicate, and issuing the
//! sub-request through the dispatch seam. Floating nodes are dispatched
//! fire-and-forget. The compiled graph is immutable; given the same graph
//! and endpoint, the set of visited nodes is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use flow_repr::reduce::reduce_requests;
use flow_repr::request::{DEFAULT_ENDPOINT, RESULTS_KEY};
use flow_repr::{
    DataRequest, DocBatch, Error, ErrorStrategy, Predicate, Route, RouteStatus, Value,
};
use flow_service::pool::ConnectionPool;
use flow_topology::{CompiledFlow, GATEWAY_END, GATEWAY_START};

/// How the driver reaches downstream nodes. Implemented by the connection
/// pool; tests substitute an in-process dispatch.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn send(
        &self,
        address: &str,
        req: &DataRequest,
        deadline: Option<Duration>,
    ) -> Result<DataRequest, Error>;

    fn is_healthy(&self, address: &str) -> bool {
        true
    }
}

#[async_trait]
impl Dispatch for ConnectionPool {
    async fn send(
        &self,
        address: &str,
        req: &DataRequest,
        deadline: Option<Duration>,
    ) -> Result<DataRequest, Error> {
        ConnectionPool::send(self, address, req, deadline).await
    }

    fn is_healthy(&self, address: &str) -> bool {
        ConnectionPool::is_healthy(self, address)
    }
}

/// Drives requests through one compiled flow.
pub struct GraphDriver {
    flow: CompiledFlow,
    /// Topological order of the graph, computed once.
    topo_order: Vec<String>,
    /// Parsed `when` predicates per node.
    predicates: BTreeMap<String, Predicate>,
    dispatch: Arc<dyn Dispatch>,
    /// Round-robin cursor per node for its address list.
    cursors: BTreeMap<String, AtomicUsize>,
    /// Endpoints each node serves, learned through discovery. A node absent
    /// here is never gated.
    endpoints: RwLock<BTreeMap<String, BTreeSet<String>>>,
    on_error: ErrorStrategy,
    timeout_send: Option<Duration>,
}

impl GraphDriver {
    pub fn new(
        flow: CompiledFlow,
        dispatch: Arc<dyn Dispatch>,
        on_error: ErrorStrategy,
        timeout_send: Option<Duration>,
    ) -> Result<GraphDriver, Error> {
        let mut predicates = BTreeMap::new();
        for (node, meta) in &flow.metadata {
            if let Some(when) = &meta.when {
                let predicate = Predicate::from_json(when).map_err(|e| {
                    Error::invalid_input("gateway", format!("bad when predicate on {node}: {e}"))
                })?;
                predicates.insert(node.clone(), predicate);
            }
        }
        let topo_order = topological_order(&flow.graph);
        let cursors = flow
            .graph
            .keys()
            .map(|node| (node.clone(), AtomicUsize::new(0)))
            .collect();
        Ok(GraphDriver {
            flow,
            topo_order,
            predicates,
            dispatch,
            cursors,
            endpoints: RwLock::new(BTreeMap::new()),
            on_error,
            timeout_send,
        })
    }

    /// Records the endpoints `node` serves; used to skip nodes that bind
    /// neither the request endpoint nor a default handler.
    pub fn set_endpoints(&self, node: &str, endpoints: BTreeSet<String>) {
        self.endpoints.write().insert(node.to_string(), endpoints);
    }

    /// The compiled flow this driver serves.
    pub fn flow(&self) -> &CompiledFlow {
        &self.flow
    }

    /// The flow's error strategy.
    pub fn on_error(&self) -> ErrorStrategy {
        self.on_error
    }

    /// Executes one request through the graph and returns the merged final
    /// response.
    pub async fn execute(&self, mut req: DataRequest) -> Result<DataRequest, Error> {
        if req.effective_endpoint().is_empty() {
            return Err(Error::invalid_input("gateway", "request names no endpoint"));
        }
        req.headers.on_error = self.on_error;
        let input_parameters: BTreeMap<String, Value> = req
            .parameters
            .iter()
            .filter(|(k, _)| k.as_str() != RESULTS_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let endpoint = req.effective_endpoint().to_string();
        let target_executor = req
            .headers
            .target_executor
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| Error::invalid_input("gateway", format!("bad target_executor: {e}")))?;

        let mut results: BTreeMap<String, Value> = BTreeMap::new();
        let mut parts: HashMap<&str, Vec<DataRequest>> = HashMap::new();
        parts.insert(GATEWAY_START, vec![req]);

        for node in &self.topo_order {
            let Some(inputs) = parts.remove(node.as_str()) else {
                continue;
            };
            if node == GATEWAY_END {
                let mut response = reduce_requests(inputs, false)
                    .expect("end-gateway always receives at least one part");
                self.collect_results(&mut response, &mut results);
                response.parameters = input_parameters.clone();
                if !results.is_empty() {
                    response
                        .parameters
                        .insert(RESULTS_KEY.to_string(), Value::Map(results));
                }
                return Ok(response);
            }

            let output = if node == GATEWAY_START {
                inputs.into_iter().next().expect("gateway part present")
            } else {
                let meta = self.flow.metadata.get(node).cloned().unwrap_or_default();
                let merged = reduce_requests(inputs, meta.disable_reduce)
                    .expect("graph edges deliver at least one part");
                let mut response = self
                    .run_node(node, merged, &endpoint, target_executor.as_ref(), meta.floating)
                    .await;
                self.collect_results(&mut response, &mut results);
                response.parameters = input_parameters.clone();
                if meta.floating {
                    // Responses of floating nodes are discarded.
                    continue;
                }
                if self.on_error == ErrorStrategy::ThrowEarly && response.first_failure().is_some()
                {
                    return Ok(response);
                }
                response
            };

            let downstreams = self.flow.graph.get(node).cloned().unwrap_or_default();
            let mut outputs = distribute(output, downstreams.len());
            for downstream in downstreams.iter().rev() {
                let part = outputs.pop().expect("one output per downstream");
                let slot = self
                    .flow
                    .graph
                    .get_key_value(downstream)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(GATEWAY_END);
                parts.entry(slot).or_default().push(part);
            }
        }

        // Only floating leaves remained: nothing is due back to the client.
        Ok(DataRequest::new(endpoint, DocBatch::empty()))
    }

    /// Runs one node: predicate filtering, gating, dispatch, rejoining.
    async fn run_node(
        &self,
        node: &str,
        mut req: DataRequest,
        endpoint: &str,
        target_executor: Option<&regex::Regex>,
        floating: bool,
    ) -> DataRequest {
        // Documents failing the node's predicate travel around it, not
        // through it.
        let mut held_out = DocBatch::empty();
        if let Some(predicate) = self.predicates.get(node) {
            let (sent, held): (Vec<_>, Vec<_>) = std::mem::take(&mut req.docs)
                .into_iter()
                .partition(|doc| predicate.matches(&doc.tag_root()));
            req.docs = DocBatch(sent);
            held_out = DocBatch(held);
        }

        let gated_by_target = target_executor.is_some_and(|re| !re.is_match(node));
        let gated_by_endpoint = {
            let endpoints = self.endpoints.read();
            endpoints.get(node).is_some_and(|eps| {
                !eps.contains(endpoint) && !eps.contains(DEFAULT_ENDPOINT)
            })
        };

        let mut response = if gated_by_target || gated_by_endpoint {
            debug!(node, gated_by_target, gated_by_endpoint, "graph: node skipped");
            req
        } else if floating {
            self.dispatch_floating(node, req.clone());
            req
        } else {
            match self.send_to_node(node, &req).await {
                Ok(response) => response,
                Err(err) => {
                    // The node was unreachable; surface it in the routes
                    // table and keep the batch for the skip strategies.
                    req.routes.push(Route {
                        node: node.to_string(),
                        status: RouteStatus::Failed,
                        error: Some(err),
                    });
                    req
                }
            }
        };

        if !held_out.is_empty() {
            response.docs = rejoin(held_out, response.docs);
        }
        response
    }

    /// Sends to one of the node's addresses, round-robin with health-aware
    /// skipping. Transport-level retries live in the pool.
    async fn send_to_node(&self, node: &str, req: &DataRequest) -> Result<DataRequest, Error> {
        let addresses = self
            .flow
            .addresses
            .get(node)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::unavailable(node, "node has no addresses"))?;
        let start = self
            .cursors
            .get(node)
            .map(|c| c.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(0);
        let mut last_err = None;
        for offset in 0..addresses.len() {
            let address = &addresses[(start + offset) % addresses.len()];
            if offset + 1 < addresses.len() && !self.dispatch.is_healthy(address) {
                continue;
            }
            match self.dispatch.send(address, req, self.timeout_send).await {
                Ok(response) => return Ok(response),
                Err(err) if err.kind.is_retryable() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::unavailable(node, "no healthy address")))
    }

    /// Fire-and-forget dispatch to a floating node. Errors are logged and
    /// otherwise discarded.
    fn dispatch_floating(&self, node: &str, req: DataRequest) {
        let Some(address) = self
            .flow
            .addresses
            .get(node)
            .and_then(|a| a.first())
            .cloned()
        else {
            warn!(node, "graph: floating node has no address");
            return;
        };
        let dispatch = Arc::clone(&self.dispatch);
        let timeout = self.timeout_send;
        let node = node.to_string();
        let label = node.clone();
        flow_ore::task::spawn(
            || format!("floating:{label}"),
            async move {
                if let Err(err) = dispatch.send(&address, &req, timeout).await {
                    warn!(node = %node, error = %err, "graph: floating dispatch failed");
                }
            },
        );
    }

    /// Pulls accumulated handler results out of a response so they can be
    /// re-attached once at the end.
    fn collect_results(&self, response: &mut DataRequest, results: &mut BTreeMap<String, Value>) {
        if let Some(Value::Map(map)) = response.parameters.remove(RESULTS_KEY) {
            for (executor, value) in map {
                results.entry(executor).or_insert(value);
            }
        }
    }
}

/// One part per downstream edge. The batch is cloned for fan-out.
fn distribute(req: DataRequest, n: usize) -> Vec<DataRequest> {
    match n {
        0 => Vec::new(),
        1 => vec![req],
        n => std::iter::repeat_with(|| req.clone()).take(n).collect(),
    }
}

/// Reattaches held-out documents after the node's response: processed
/// documents keep the node's output, held-out ones their pre-filter form,
/// and documents the node genuinely removed stay removed. Held-out documents
/// trail the processed ones; order across the filter boundary is not
/// specified.
fn rejoin(held_out: DocBatch, response: DocBatch) -> DocBatch {
    let held_ids: HashSet<&str> = held_out.iter().map(|d| d.id.as_str()).collect();
    let mut merged: DocBatch = response
        .into_iter()
        .filter(|doc| !held_ids.contains(doc.id.as_str()))
        .collect();
    merged.extend(held_out);
    merged
}

/// Kahn topological order; compilation already rejected cycles.
pub(crate) fn topological_order(graph: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = graph.keys().map(|n| (n.as_str(), 0)).collect();
    for downstreams in graph.values() {
        for downstream in downstreams {
            *in_degree.entry(downstream.as_str()).or_default() += 1;
        }
    }
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        if let Some(downstreams) = graph.get(node) {
            for downstream in downstreams {
                let d = in_degree.get_mut(downstream.as_str()).expect("all known");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(downstream.as_str());
                }
            }
        }
    }
    order
}
