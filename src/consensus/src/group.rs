// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The consensus group of one deployment, and the stateful worker facade
//! that routes write endpoints through it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::storage::Adaptor;
use openraft::{Config, Raft, SnapshotPolicy};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use flow_ore::retry::{Retry, RetryResult};
use flow_repr::schema::SchemaMap;
use flow_repr::{wire, DataRequest, Error, ErrorKind};
use flow_service::DataService;
use flow_worker::WorkerRuntime;

use crate::network::PeerNetworkFactory;
use crate::proto::raft_client::RaftClient;
use crate::storage::ReplicaStore;
use crate::{proto, RaftSettings, ReplicaId, ReplicaNode, TypeConfig};

/// One replica's membership in its deployment's Raft group.
pub struct ConsensusGroup {
    settings: RaftSettings,
    raft: Raft<TypeConfig>,
    store: Arc<ReplicaStore>,
    network: PeerNetworkFactory,
}

impl ConsensusGroup {
    /// Opens the durable state and starts the Raft instance. The group does
    /// not serve writes until [`ConsensusGroup::join_or_bootstrap`] ran on
    /// some replica.
    pub async fn start(
        runtime: Arc<WorkerRuntime>,
        settings: RaftSettings,
    ) -> anyhow::Result<Arc<ConsensusGroup>> {
        let store = ReplicaStore::open(&settings.state_dir, runtime).await?;

        let config = Config {
            cluster_name: format!("flow-{}", settings.replica_id),
            heartbeat_interval: settings.heartbeat_ms,
            election_timeout_min: settings.election_timeout_min_ms,
            election_timeout_max: settings.election_timeout_max_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(settings.snapshot_threshold),
            max_in_snapshot_log_to_keep: settings.trailing_logs,
            ..Default::default()
        };
        let config = Arc::new(config.validate()?);

        let network = PeerNetworkFactory::new();
        network.register(
            settings.replica_id,
            ReplicaNode {
                rpc_addr: settings.address.clone(),
            },
        );
        for (id, addr) in &settings.peers {
            network.register(*id, ReplicaNode {
                rpc_addr: addr.clone(),
            });
        }

        let (log_store, state_machine) = Adaptor::new(Arc::clone(&store));
        let raft = Raft::new(
            settings.replica_id,
            config,
            network.clone(),
            log_store,
            state_machine,
        )
        .await?;

        info!(replica = settings.replica_id, "consensus: raft started");
        Ok(Arc::new(ConsensusGroup {
            settings,
            raft,
            store,
            network,
        }))
    }

    /// On the bootstrap replica: initializes the group with itself as the
    /// only voter, once. On every other replica: asks the peers' leader to
    /// admit it as a voter, retrying while the group elects.
    pub async fn join_or_bootstrap(&self) -> anyhow::Result<()> {
        if self.raft.is_initialized().await? {
            return Ok(());
        }
        if self.settings.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                self.settings.replica_id,
                ReplicaNode {
                    rpc_addr: self.settings.address.clone(),
                },
            );
            self.raft.initialize(members).await?;
            info!(
                replica = self.settings.replica_id,
                "consensus: bootstrapped group"
            );
            return Ok(());
        }

        let request = proto::AddVoterRequest {
            replica_id: self.settings.replica_id,
            address: self.settings.address.clone(),
        };
        Retry::default()
            .initial_backoff(Duration::from_millis(250))
            .max_duration(Duration::from_secs(60))
            .retry_async(|state| {
                let request = request.clone();
                async move {
                    for (peer, addr) in &self.settings.peers {
                        if *peer == self.settings.replica_id {
                            continue;
                        }
                        match add_voter_via(addr, request.clone()).await {
                            Ok(()) => return RetryResult::Ok(()),
                            Err(err) => {
                                debug!(
                                    attempt = state.i,
                                    peer = *peer,
                                    error = %err,
                                    "consensus: join attempt failed"
                                );
                            }
                        }
                    }
                    RetryResult::RetryableErr(anyhow::anyhow!("no peer admitted us yet"))
                }
            })
            .await?;
        info!(replica = self.settings.replica_id, "consensus: joined as voter");
        Ok(())
    }

    /// Leader-side voter admission: adds the replica as a learner, waits for
    /// it to catch up, then promotes it into the voter set.
    pub async fn add_voter(&self, id: ReplicaId, address: String) -> Result<(), Error> {
        let node = ReplicaNode {
            rpc_addr: address.clone(),
        };
        self.network.register(id, node.clone());
        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(|e| Error::unavailable("consensus", format!("add_learner: {e}")))?;

        let mut voters: BTreeSet<ReplicaId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| Error::unavailable("consensus", format!("change_membership: {e}")))?;
        info!(replica = id, %address, "consensus: admitted voter");
        Ok(())
    }

    /// Proposes a write locally. Fails when this replica is not the leader.
    ///
    /// Success means the entry committed (majority-acked) and applied here;
    /// a timeout before commit surfaces as `Unavailable` and the outcome is
    /// unknown to the caller.
    pub async fn propose(&self, entry: Vec<u8>) -> Result<Vec<u8>, Error> {
        match self.raft.client_write(entry).await {
            Ok(response) => Ok(response.data),
            Err(e) => Err(Error::unavailable(
                "consensus",
                format!("write not committed: {e}"),
            )),
        }
    }

    /// Proposes a write, forwarding to the current leader when this replica
    /// is a follower. Retries while an election is in progress.
    pub async fn propose_with_forward(&self, entry: Vec<u8>) -> Result<Vec<u8>, Error> {
        if self.is_leader() {
            return self.propose(entry).await;
        }
        Retry::default()
            .initial_backoff(Duration::from_millis(50))
            .max_tries(5)
            .retry_async(|_state| {
                let entry = entry.clone();
                async move {
                    let Some(leader) = self.current_leader() else {
                        return RetryResult::RetryableErr(Error::unavailable(
                            "consensus",
                            "no leader elected yet",
                        ));
                    };
                    if leader == self.settings.replica_id {
                        return match self.propose(entry).await {
                            Ok(resp) => RetryResult::Ok(resp),
                            Err(e) => RetryResult::RetryableErr(e),
                        };
                    }
                    let Some(node) = self.network.lookup(leader) else {
                        return RetryResult::RetryableErr(Error::unavailable(
                            "consensus",
                            format!("leader {leader} has no known address"),
                        ));
                    };
                    match forward_via(&node.rpc_addr, entry).await {
                        Ok(resp) => RetryResult::Ok(resp),
                        Err(err) if err.kind == ErrorKind::Unavailable => {
                            warn!(leader, error = %err, "consensus: forward failed");
                            RetryResult::RetryableErr(err)
                        }
                        Err(err) => RetryResult::FatalErr(err),
                    }
                }
            })
            .await
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(metrics.id)
    }

    pub fn current_leader(&self) -> Option<ReplicaId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The Raft instance, for the RPC service.
    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    /// The durable store (and through it the hosted runtime).
    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!("consensus: shutdown error: {e}");
        }
    }
}

async fn raft_channel(address: &str) -> Result<Channel, Error> {
    Channel::from_shared(format!("http://{address}"))
        .map_err(|e| Error::invalid_input("consensus", format!("bad peer address: {e}")))?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
        .map_err(|e| Error::unavailable("consensus", format!("dial {address}: {e}")))
}

async fn forward_via(address: &str, entry: Vec<u8>) -> Result<Vec<u8>, Error> {
    let mut client = RaftClient::new(raft_channel(address).await?);
    let response = client
        .forward(proto::ForwardRequest { request: entry })
        .await
        .map_err(|e| Error::unavailable("consensus", format!("forward rpc: {e}")))?
        .into_inner();
    if !response.error.is_empty() {
        return Err(Error::unavailable("consensus", response.error));
    }
    Ok(response.response)
}

async fn add_voter_via(address: &str, request: proto::AddVoterRequest) -> anyhow::Result<()> {
    let mut client = RaftClient::new(
        raft_channel(address)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let response = client.add_voter(request).await?.into_inner();
    if !response.error.is_empty() {
        anyhow::bail!("{}", response.error);
    }
    Ok(())
}

/// The data-plane facade of one stateful replica: write endpoints go through
/// the log, reads hit the runtime directly.
pub struct StatefulWorker {
    runtime: Arc<WorkerRuntime>,
    group: Arc<ConsensusGroup>,
}

impl StatefulWorker {
    pub fn new(group: Arc<ConsensusGroup>) -> StatefulWorker {
        StatefulWorker {
            runtime: Arc::clone(group.store().runtime()),
            group,
        }
    }

    fn is_write(&self, req: &DataRequest) -> bool {
        match self.runtime.registry().resolve(req.effective_endpoint()) {
            Ok((_, schema)) => schema.write_op,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl DataService for StatefulWorker {
    async fn process(&self, req: DataRequest) -> Result<DataRequest, Error> {
        if !self.is_write(&req) {
            return self.runtime.process(req).await;
        }
        let entry = wire::encode(&req)?.to_vec();
        let response = self.group.propose_with_forward(entry).await?;
        if response.is_empty() {
            return Err(Error::internal(
                self.runtime.name(),
                "replicated write applied without a response",
            ));
        }
        wire::decode(&response)
    }

    fn schema_map(&self) -> SchemaMap {
        self.runtime.registry().schema_map()
    }

    fn is_leader(&self) -> Option<bool> {
        Some(self.group.is_leader())
    }
}

#[cfg(test)]
mod tests {
    use flow_executor::testing::CounterExecutor;
    use flow_repr::{DocBatch, Document, Value};

    use super::*;

    fn settings(dir: &std::path::Path) -> RaftSettings {
        RaftSettings {
            replica_id: 1,
            bootstrap: true,
            peers: BTreeMap::new(),
            address: "127.0.0.1:0".into(),
            state_dir: dir.to_path_buf(),
            snapshot_threshold: 1000,
            trailing_logs: 64,
            heartbeat_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
        }
    }

    async fn single_node_group(dir: &std::path::Path) -> Arc<ConsensusGroup> {
        let runtime = Arc::new(WorkerRuntime::new(
            "counter0",
            Arc::new(CounterExecutor::new()),
        ));
        let group = ConsensusGroup::start(runtime, settings(dir)).await.unwrap();
        group.join_or_bootstrap().await.unwrap();
        // Single-voter group: leadership is immediate once initialized.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !group.is_leader() {
            assert!(tokio::time::Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        group
    }

    fn write_request(n: usize) -> DataRequest {
        DataRequest::new(
            "/index",
            (0..n).map(|i| Document::with_id(format!("d{i}"))).collect(),
        )
    }

    #[tokio::test]
    async fn committed_writes_apply_and_reads_see_them() {
        let dir = tempfile::tempdir().unwrap();
        let group = single_node_group(dir.path()).await;
        let worker = StatefulWorker::new(Arc::clone(&group));

        for _ in 0..10 {
            let resp = worker.process(write_request(1)).await.unwrap();
            assert!(resp.first_failure().is_none());
        }
        let resp = worker
            .process(DataRequest::new("/count", DocBatch::empty()))
            .await
            .unwrap();
        match &resp.results().unwrap()["counter0"] {
            Value::Map(map) => assert_eq!(map.get("count"), Some(&Value::Int(10))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.is_leader(), Some(true));
        group.shutdown().await;
    }

    #[tokio::test]
    async fn reads_bypass_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let group = single_node_group(dir.path()).await;
        let worker = StatefulWorker::new(Arc::clone(&group));

        let before = group.raft().metrics().borrow().last_log_index;
        worker
            .process(DataRequest::new("/count", DocBatch::empty()))
            .await
            .unwrap();
        let after = group.raft().metrics().borrow().last_log_index;
        assert_eq!(before, after);
        group.shutdown().await;
    }
}
