// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Raft transport: openraft RPCs carried over the `Raft` gRPC service
//! as bincode payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use parking_lot::RwLock;
use tonic::transport::Channel;

use crate::proto::raft_client::RaftClient;
use crate::proto::RaftRpcRequest;
use crate::{decode, encode, ReplicaId, ReplicaNode, TypeConfig};

/// A connection to one peer replica.
pub struct PeerConnection {
    target: ReplicaId,
    channel: Channel,
}

impl PeerConnection {
    async fn rpc<Req, Resp, E>(
        &mut self,
        rpc: &str,
        request: &Req,
    ) -> Result<Resp, RPCError<ReplicaId, ReplicaNode, E>>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
        E: std::error::Error,
    {
        tracing::trace!(target = self.target, rpc, "raft: outbound rpc");
        let payload =
            encode(request).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        let mut client = RaftClient::new(self.channel.clone());
        let response = client
            .raft_rpc(tonic::Request::new(RaftRpcRequest {
                rpc: rpc.to_string(),
                payload,
            }))
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?
            .into_inner();
        if !response.error.is_empty() {
            let err = std::io::Error::new(std::io::ErrorKind::Other, response.error);
            return Err(RPCError::Network(NetworkError::new(&err)));
        }
        decode(&response.payload).map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }
}

impl RaftNetwork<TypeConfig> for PeerConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<ReplicaId>,
        RPCError<ReplicaId, ReplicaNode, RaftError<ReplicaId>>,
    > {
        self.rpc("append_entries", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<ReplicaId>,
        RPCError<ReplicaId, ReplicaNode, RaftError<ReplicaId, InstallSnapshotError>>,
    > {
        self.rpc("install_snapshot", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<ReplicaId>,
        _option: RPCOption,
    ) -> Result<
        VoteResponse<ReplicaId>,
        RPCError<ReplicaId, ReplicaNode, RaftError<ReplicaId>>,
    > {
        self.rpc("vote", &rpc).await
    }
}

/// Creates peer connections and tracks the known membership addresses.
#[derive(Clone, Default)]
pub struct PeerNetworkFactory {
    nodes: Arc<RwLock<HashMap<ReplicaId, ReplicaNode>>>,
    channels: Arc<RwLock<HashMap<ReplicaId, Channel>>>,
}

impl PeerNetworkFactory {
    pub fn new() -> PeerNetworkFactory {
        PeerNetworkFactory::default()
    }

    /// Records a peer address, replacing any previous entry.
    pub fn register(&self, id: ReplicaId, node: ReplicaNode) {
        self.nodes.write().insert(id, node);
    }

    /// The known address of a replica, if any. Used for leader forwarding.
    pub fn lookup(&self, id: ReplicaId) -> Option<ReplicaNode> {
        self.nodes.read().get(&id).cloned()
    }

    fn channel(&self, id: ReplicaId, node: &ReplicaNode) -> Channel {
        if let Some(channel) = self.channels.read().get(&id) {
            return channel.clone();
        }
        // Lazy channel: no connection is made until the first RPC, and tonic
        // redials internally after failures.
        let channel = Channel::from_shared(format!("http://{}", node.rpc_addr))
            .expect("peer address forms a valid uri")
            .connect_timeout(Duration::from_secs(5))
            .connect_lazy();
        self.channels.write().insert(id, channel.clone());
        channel
    }
}

impl RaftNetworkFactory<TypeConfig> for PeerNetworkFactory {
    type Network = PeerConnection;

    async fn new_client(&mut self, target: ReplicaId, node: &ReplicaNode) -> Self::Network {
        self.register(target, node.clone());
        PeerConnection {
            target,
            channel: self.channel(target, node),
        }
    }
}
