// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-deployment replication for stateful executors.
//!
//! A deployment that declares `stateful: true` wraps one worker runtime per
//! replica inside a Raft group (built on `openraft`). Requests for
//! write-flagged endpoints enter the log as their wire encoding and are
//! applied — that is, the handler is invoked — in log order at every
//! replica; reads bypass the log entirely. Snapshots delegate to the
//! executor's `snapshot`/`restore` callbacks and, together with the durable
//! log, make state survive replica restarts.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod group;
pub mod network;
pub mod service;
pub mod storage;

pub use group::{ConsensusGroup, StatefulWorker};

/// The generated proto types for the `flowraft` package.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("flowraft");
}

/// A stable replica identifier within one deployment's group.
pub type ReplicaId = u64;

/// Cluster-membership info for one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReplicaNode {
    /// The address of the replica's Raft gRPC service.
    pub rpc_addr: String,
}

impl std::fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rpc_addr)
    }
}

/// The openraft type configuration: log entries and responses are raw wire
/// bytes, opaque to the consensus layer.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd)]
#[derive(Serialize, Deserialize)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    /// Log entry data: the wire-encoded write request.
    type D = Vec<u8>;
    /// Response data: the wire-encoded response request.
    type R = Vec<u8>;
    type NodeId = ReplicaId;
    type Node = ReplicaNode;
    type Entry = openraft::Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

/// The per-replica consensus settings passed via `--raft-configuration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSettings {
    /// This replica's stable id.
    pub replica_id: ReplicaId,
    /// Whether this replica bootstraps the group on first launch.
    #[serde(default)]
    pub bootstrap: bool,
    /// Known peers, replica id → Raft RPC address. Must include the
    /// bootstrap replica so joiners can find the leader.
    #[serde(default)]
    pub peers: BTreeMap<ReplicaId, String>,
    /// This replica's own Raft RPC address.
    pub address: String,
    /// Directory for the durable log, vote metadata, and snapshots.
    pub state_dir: PathBuf,
    /// Take a snapshot once this many entries accumulated since the last.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    /// Log entries retained past a snapshot's truncation point.
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
}

fn default_snapshot_threshold() -> u64 {
    1000
}

fn default_trailing_logs() -> u64 {
    256
}

fn default_heartbeat_ms() -> u64 {
    100
}

fn default_election_min_ms() -> u64 {
    300
}

fn default_election_max_ms() -> u64 {
    600
}

impl RaftSettings {
    pub fn from_json(json: &str) -> Result<RaftSettings, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Bincode helpers shared by the storage and network layers.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
