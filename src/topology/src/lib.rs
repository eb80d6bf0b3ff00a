// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Flow descriptions and their compilation into a routable topology.
//!
//! A [`FlowSpec`] is the declarative description the user supplies; the
//! [`compile`] step turns it into the immutable [`CompiledFlow`] the gateway
//! and the launchers consume: a graph map with the two synthetic gateway
//! nodes, an address map, per-node routing metadata, and per-deployment
//! internal wiring. Compilation is the only place addresses are allocated
//! and schemas are checked; no runtime rebuild is allowed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use flow_repr::schema::SchemaMap;
use flow_repr::{ErrorStrategy, Value};

mod compile;

pub use compile::{compile, CompileError};

/// The synthetic node at which every request enters the graph.
pub const GATEWAY_START: &str = "start-gateway";

/// The synthetic node at which responses are due back to the client.
pub const GATEWAY_END: &str = "end-gateway";

/// The fan-out policy across the shards of one deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PollingMode {
    /// Pick one shard, round-robin.
    #[default]
    Any,
    /// Fan out to every shard and merge.
    All,
}

/// Polling, either uniform or per endpoint (with a `*` fallback entry).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Polling {
    Single(PollingMode),
    PerEndpoint(BTreeMap<String, PollingMode>),
}

impl Default for Polling {
    fn default() -> Self {
        Polling::Single(PollingMode::Any)
    }
}

impl Polling {
    /// The mode applying to `endpoint`: an exact entry wins, then the `*`
    /// fallback, then ANY.
    pub fn for_endpoint(&self, endpoint: &str) -> PollingMode {
        match self {
            Polling::Single(mode) => *mode,
            Polling::PerEndpoint(map) => map
                .get(endpoint)
                .or_else(|| map.get("*"))
                .copied()
                .unwrap_or_default(),
        }
    }
}

fn default_one() -> usize {
    1
}

/// One deployment in a flow description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    /// Executor reference, resolved through the plugin registry.
    pub uses: String,
    #[serde(default)]
    pub uses_with: BTreeMap<String, Value>,
    /// Overrides the executor instance name.
    #[serde(default)]
    pub uses_metas: Option<String>,
    #[serde(default = "default_one")]
    pub replicas: usize,
    #[serde(default = "default_one")]
    pub shards: usize,
    #[serde(default)]
    pub polling: Polling,
    /// Wrapper executor invoked by the head before fan-out.
    #[serde(default)]
    pub uses_before: Option<String>,
    /// Wrapper executor invoked by the head on the merged response.
    #[serde(default)]
    pub uses_after: Option<String>,
    /// Upstream deployment names; empty means the gateway feeds this node.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Structured document filter on the edges into this node.
    #[serde(default)]
    pub when: Option<serde_json::Value>,
    /// Fire-and-forget sink: the gateway never awaits its responses.
    #[serde(default)]
    pub floating: bool,
    /// Do not launch; connect out to the given host/port instead.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub host: Option<String>,
    /// Explicit port; OS-assigned otherwise.
    #[serde(default)]
    pub port: Option<u16>,
    /// Concatenate fan-in responses instead of id-keyed merging.
    #[serde(default)]
    pub disable_reduce: bool,
    /// Replicate write endpoints through a consensus group.
    #[serde(default)]
    pub stateful: bool,
    /// Declared endpoint schemas, used for edge compatibility checking.
    #[serde(default)]
    pub schemas: SchemaMap,
}

/// A declarative flow description.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    pub deployments: Vec<DeploymentSpec>,
    #[serde(default)]
    pub on_error: ErrorStrategy,
    /// Maximum in-flight requests per client call; 0 means uncapped.
    #[serde(default)]
    pub prefetch: usize,
    /// Emit responses in submission order (default) or completion order.
    #[serde(default = "default_true")]
    pub results_in_order: bool,
}

fn default_true() -> bool {
    true
}

impl FlowSpec {
    pub fn from_json(json: &str) -> Result<FlowSpec, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Routing metadata for one node of the compiled graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    pub floating: bool,
    /// Document filter on the edges into this node, in predicate JSON form.
    #[serde(default)]
    pub when: Option<serde_json::Value>,
    #[serde(default)]
    pub disable_reduce: bool,
    /// In-degree: how many upstream parts converge here before it runs.
    pub number_of_parts: usize,
}

/// Internal wiring of one deployment: where its head and workers listen.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeploymentAddresses {
    /// The head address, present when the deployment fronts its workers
    /// with a head (sharded, replicated, or wrapped).
    #[serde(default)]
    pub head: Option<String>,
    /// Worker addresses, `shards[shard][replica]`.
    pub shards: Vec<Vec<String>>,
}

impl DeploymentAddresses {
    /// The address the gateway sends to for this deployment.
    pub fn ingress(&self) -> Vec<String> {
        match &self.head {
            Some(head) => vec![head.clone()],
            None => self.shards.iter().flatten().cloned().collect(),
        }
    }
}

/// The immutable output of compilation, consumed verbatim by the gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompiledFlow {
    /// Adjacency: node name → downstream node names, with the synthetic
    /// `start-gateway` and `end-gateway` nodes.
    pub graph: BTreeMap<String, Vec<String>>,
    /// Node name → the endpoints serving requests for it. Floating nodes
    /// appear here too; the gateway dispatches to them without awaiting.
    pub addresses: BTreeMap<String, Vec<String>>,
    /// Per-node routing metadata.
    pub metadata: BTreeMap<String, NodeMeta>,
    /// Per-deployment internal wiring, for the launchers.
    pub internal: BTreeMap<String, DeploymentAddresses>,
}

impl CompiledFlow {
    pub fn from_json(json: &str) -> Result<CompiledFlow, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("compiled flow serializes")
    }
}
