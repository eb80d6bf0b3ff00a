// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The server side of the Raft gRPC service: protocol RPC dispatch, write
//! forwarding, and voter admission.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::group::ConsensusGroup;
use crate::proto::raft_server::{Raft as RaftService, RaftServer};
use crate::{decode, encode, proto};

/// Serves one replica's side of the Raft protocol.
pub struct ConsensusService {
    group: Arc<ConsensusGroup>,
}

impl ConsensusService {
    pub fn new(group: Arc<ConsensusGroup>) -> ConsensusService {
        ConsensusService { group }
    }

    /// Serves until the listener task is aborted.
    pub async fn serve(
        group: Arc<ConsensusGroup>,
        listener: TcpListener,
    ) -> anyhow::Result<()> {
        Server::builder()
            .add_service(RaftServer::new(ConsensusService::new(group)))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await?;
        Ok(())
    }
}

fn bincode_status(e: bincode::Error) -> Status {
    Status::invalid_argument(format!("undecodable raft payload: {e}"))
}

#[async_trait]
impl RaftService for ConsensusService {
    async fn raft_rpc(
        &self,
        request: Request<proto::RaftRpcRequest>,
    ) -> Result<Response<proto::RaftRpcResponse>, Status> {
        let request = request.into_inner();
        debug!(rpc = %request.rpc, "raft: inbound rpc");
        let raft = self.group.raft();
        let result: Result<Vec<u8>, String> = match request.rpc.as_str() {
            "append_entries" => {
                let rpc = decode(&request.payload).map_err(bincode_status)?;
                match raft.append_entries(rpc).await {
                    Ok(resp) => encode(&resp).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            "install_snapshot" => {
                let rpc = decode(&request.payload).map_err(bincode_status)?;
                match raft.install_snapshot(rpc).await {
                    Ok(resp) => encode(&resp).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            "vote" => {
                let rpc = decode(&request.payload).map_err(bincode_status)?;
                match raft.vote(rpc).await {
                    Ok(resp) => encode(&resp).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            other => Err(format!("unknown raft rpc {other}")),
        };
        let response = match result {
            Ok(payload) => proto::RaftRpcResponse {
                payload,
                error: String::new(),
            },
            Err(error) => proto::RaftRpcResponse {
                payload: Vec::new(),
                error,
            },
        };
        Ok(Response::new(response))
    }

    async fn forward(
        &self,
        request: Request<proto::ForwardRequest>,
    ) -> Result<Response<proto::ForwardResponse>, Status> {
        let entry = request.into_inner().request;
        let response = match self.group.propose(entry).await {
            Ok(response) => proto::ForwardResponse {
                response,
                error: String::new(),
                leader_hint: 0,
                has_leader_hint: false,
            },
            Err(err) => {
                let leader = self.group.current_leader();
                proto::ForwardResponse {
                    response: Vec::new(),
                    error: err.message,
                    leader_hint: leader.unwrap_or(0),
                    has_leader_hint: leader.is_some(),
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn add_voter(
        &self,
        request: Request<proto::AddVoterRequest>,
    ) -> Result<Response<proto::AddVoterResponse>, Status> {
        let request = request.into_inner();
        let response = match self
            .group
            .add_voter(request.replica_id, request.address)
            .await
        {
            Ok(()) => proto::AddVoterResponse {
                error: String::new(),
                leader_hint: 0,
                has_leader_hint: false,
            },
            Err(err) => {
                let leader = self.group.current_leader();
                proto::AddVoterResponse {
                    error: err.message,
                    leader_hint: leader.unwrap_or(0),
                    has_leader_hint: leader.is_some(),
                }
            }
        };
        Ok(Response::new(response))
    }
}
