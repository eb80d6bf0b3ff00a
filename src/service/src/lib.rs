// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! RPC plumbing shared by the flowd roles.
//!
//! This crate owns the proto definitions for the internal `Data` service and
//! the client-facing `Gateway` service, the [`DataService`] trait that heads
//! and workers implement, and the process-wide outbound [`pool`] used by
//! every component that issues sub-requests.

use async_trait::async_trait;
use flow_repr::schema::SchemaMap;
use flow_repr::{DataRequest, Error};

pub mod grpc;
pub mod pool;

/// The generated proto types for the `flowdata` package.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("flowdata");
}

/// The internal RPC surface served by heads and workers.
///
/// Implementations are invoked both remotely (through [`grpc::DataServer`])
/// and locally (heads call their wrapper runtimes in process).
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    /// Invokes the endpoint handler on the request's batch and returns the
    /// transformed request.
    ///
    /// Handler-level failures are reported *inside* the returned request's
    /// routes table, not as an `Err`: the batch survives where possible so
    /// that chained reducers can still operate under the skip strategies.
    /// `Err` is reserved for conditions where no usable request exists
    /// (malformed payload, cancelled call).
    async fn process(&self, req: DataRequest) -> Result<DataRequest, Error>;

    /// The endpoint schemas this node serves.
    fn schema_map(&self) -> SchemaMap;

    /// Liveness, for health probes.
    fn serving(&self) -> bool {
        true
    }

    /// For replicas of a stateful deployment: whether this replica currently
    /// leads its consensus group. `None` for stateless nodes. Exposed in the
    /// health response so heads can prefer the leader for writes.
    fn is_leader(&self) -> Option<bool> {
        None
    }
}
