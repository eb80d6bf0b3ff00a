// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-deployment head.
//!
//! A head fronts the workers of one deployment: it runs the optional
//! `uses_before`/`uses_after` wrappers in process, picks shards according to
//! the polling policy (ANY round-robin or ALL fan-out), round-robins healthy
//! replicas within a shard (preferring the consensus leader for writes), and
//! merges fan-out responses id-keyed before answering upstream.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;
use tracing::{debug, warn};

use flow_repr::reduce::reduce_requests;
use flow_repr::schema::SchemaMap;
use flow_repr::{DataRequest, Error, Route, RouteStatus};
use flow_service::pool::ConnectionPool;
use flow_service::DataService;
use flow_topology::{Polling, PollingMode};
use flow_worker::WorkerRuntime;

/// How the head reaches its replicas. Implemented by the connection pool;
/// tests substitute an in-process transport.
#[async_trait]
pub trait ShardTransport: Send + Sync + 'static {
    async fn process(
        &self,
        address: &str,
        req: &DataRequest,
        deadline: Option<Duration>,
    ) -> Result<DataRequest, Error>;

    /// One health probe; `detail` is `"leader"`/`"follower"` for stateful
    /// replicas.
    async fn health(&self, address: &str) -> Result<(bool, String), Error>;

    /// Cheap local health estimate used for round-robin skipping.
    fn is_healthy(&self, address: &str) -> bool {
        true
    }
}

#[async_trait]
impl ShardTransport for ConnectionPool {
    async fn process(
        &self,
        address: &str,
        req: &DataRequest,
        deadline: Option<Duration>,
    ) -> Result<DataRequest, Error> {
        ConnectionPool::send(self, address, req, deadline).await
    }

    async fn health(&self, address: &str) -> Result<(bool, String), Error> {
        ConnectionPool::health(self, address).await
    }

    fn is_healthy(&self, address: &str) -> bool {
        ConnectionPool::is_healthy(self, address)
    }
}

/// Static configuration of one head.
#[derive(Clone, Debug)]
pub struct HeadConfig {
    /// The deployment name; failure route entries carry it.
    pub name: String,
    /// Replica addresses, `shards[shard][replica]`.
    pub shards: Vec<Vec<String>>,
    pub polling: Polling,
    pub disable_reduce: bool,
    /// The deployment is backed by a consensus group.
    pub stateful: bool,
    /// Per-send deadline toward replicas.
    pub timeout_send: Option<Duration>,
    /// The schema map of the hosted executor, served through discovery.
    pub schema_map: SchemaMap,
}

impl HeadConfig {
    fn write_endpoints(&self) -> BTreeSet<String> {
        self.schema_map
            .iter()
            .filter(|(_, schema)| schema.write_op)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// The head runtime. Serves the same `Data` surface as a worker.
pub struct HeadRuntime {
    config: HeadConfig,
    transport: Arc<dyn ShardTransport>,
    uses_before: Option<Arc<WorkerRuntime>>,
    uses_after: Option<Arc<WorkerRuntime>>,
    write_endpoints: BTreeSet<String>,
    shard_cursor: AtomicUsize,
    replica_cursors: Vec<AtomicUsize>,
    /// Cached leader address per shard, re-learned on miss.
    leaders: Mutex<Vec<Option<String>>>,
}

impl HeadRuntime {
    pub fn new(
        config: HeadConfig,
        transport: Arc<dyn ShardTransport>,
        uses_before: Option<Arc<WorkerRuntime>>,
        uses_after: Option<Arc<WorkerRuntime>>,
    ) -> HeadRuntime {
        let shards = config.shards.len();
        HeadRuntime {
            write_endpoints: config.write_endpoints(),
            replica_cursors: (0..shards).map(|_| AtomicUsize::new(0)).collect(),
            leaders: Mutex::new(vec![None; shards]),
            shard_cursor: AtomicUsize::new(0),
            config,
            transport,
            uses_before,
            uses_after,
        }
    }

    /// Routes one request through this deployment.
    pub async fn process(&self, mut req: DataRequest) -> Result<DataRequest, Error> {
        if let Some(before) = &self.uses_before {
            req = before.process(req).await?;
        }

        let endpoint = req.effective_endpoint().to_string();
        let mode = self.config.polling.for_endpoint(&endpoint);
        let is_write = self.config.stateful && self.write_endpoints.contains(&endpoint);

        let targets: Vec<usize> = match mode {
            PollingMode::All => (0..self.config.shards.len()).collect(),
            PollingMode::Any => match self.pick_shard() {
                Some(shard) => vec![shard],
                None => Vec::new(),
            },
        };
        debug!(
            deployment = %self.config.name,
            endpoint = %endpoint,
            ?mode,
            shards = targets.len(),
            "head: dispatching"
        );

        // Zero matching shards is an empty result, not an error.
        let mut responses = Vec::new();
        let mut failures: Vec<Route> = Vec::new();
        if !targets.is_empty() {
            let sends = targets
                .iter()
                .map(|&shard| self.send_to_shard(shard, &req, is_write));
            for (shard, result) in targets.iter().zip(future::join_all(sends).await) {
                match result {
                    Ok(resp) => responses.push(resp),
                    Err(err) => {
                        warn!(
                            deployment = %self.config.name,
                            shard,
                            error = %err,
                            "head: shard failed"
                        );
                        failures.push(Route {
                            node: format!("{}/shard-{shard}", self.config.name),
                            status: RouteStatus::Failed,
                            error: Some(err),
                        });
                    }
                }
            }
        }

        let mut merged = match reduce_requests(responses, self.config.disable_reduce) {
            Some(merged) => merged,
            // Every shard failed (or none matched): answer with the original
            // batch and the failure routes so downstream reducers can still
            // operate under the skip strategies.
            None => {
                if targets.is_empty() {
                    req.docs = flow_repr::DocBatch::empty();
                }
                req
            }
        };
        merged.routes.extend(failures);

        if let Some(after) = &self.uses_after {
            merged = after.process(merged).await?;
        }
        Ok(merged)
    }

    /// Round-robin over shards that still have a usable replica.
    fn pick_shard(&self) -> Option<usize> {
        let n = self.config.shards.len();
        if n == 0 {
            return None;
        }
        let start = self.shard_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let shard = (start + offset) % n;
            if self.config.shards[shard]
                .iter()
                .any(|addr| self.transport.is_healthy(addr))
            {
                return Some(shard);
            }
        }
        // Everything looks unhealthy; probe the nominal choice anyway.
        Some(start % n)
    }

    /// Sends to one shard, trying replicas round-robin (leader first for
    /// writes) until one answers at the transport level.
    async fn send_to_shard(
        &self,
        shard: usize,
        req: &DataRequest,
        is_write: bool,
    ) -> Result<DataRequest, Error> {
        let replicas = &self.config.shards[shard];
        let mut order: Vec<&String> = Vec::with_capacity(replicas.len());

        if is_write {
            if let Some(leader) = self.leader_address(shard).await {
                if let Some(addr) = replicas.iter().find(|a| **a == leader) {
                    order.push(addr);
                }
            }
        }
        let start = self.replica_cursors[shard].fetch_add(1, Ordering::Relaxed);
        for offset in 0..replicas.len() {
            let addr = &replicas[(start + offset) % replicas.len()];
            if !order.contains(&addr) {
                order.push(addr);
            }
        }
        // Unhealthy replicas sort to the back rather than being skipped
        // outright: with every replica marked down we still must try one.
        order.sort_by_key(|addr| !self.transport.is_healthy(addr));

        let mut last_err = None;
        for addr in order {
            match self
                .transport
                .process(addr, req, self.config.timeout_send)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(err) if err.kind.is_retryable() => {
                    if is_write {
                        // The cached leader may be stale.
                        self.leaders.lock()[shard] = None;
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::unavailable(&self.config.name, "shard has no replicas")))
    }

    /// The cached leader of `shard`, discovering it via health probes when
    /// unknown.
    async fn leader_address(&self, shard: usize) -> Option<String> {
        if let Some(leader) = self.leaders.lock()[shard].clone() {
            return Some(leader);
        }
        for addr in &self.config.shards[shard] {
            match self.transport.health(addr).await {
                Ok((true, detail)) if detail == "leader" => {
                    self.leaders.lock()[shard] = Some(addr.clone());
                    return Some(addr.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(address = %addr, error = %err, "head: leader probe failed");
                }
            }
        }
        None
    }
}

#[async_trait]
impl DataService for HeadRuntime {
    async fn process(&self, req: DataRequest) -> Result<DataRequest, Error> {
        HeadRuntime::process(self, req).await
    }

    fn schema_map(&self) -> SchemaMap {
        self.config.schema_map.clone()
    }
}
