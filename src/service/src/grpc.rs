// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! gRPC hosting for [`DataService`] implementations and the status/error
//! mapping shared by every surface.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};
use tracing::debug;

use flow_repr::{wire, DataRequest, Error, ErrorKind};

use crate::proto;
use crate::DataService;

/// Hosts a [`DataService`] behind the `Data` gRPC service.
#[derive(Debug)]
pub struct GrpcServer<S> {
    inner: Arc<S>,
}

impl<S> GrpcServer<S> {
    pub fn new(inner: Arc<S>) -> Self {
        GrpcServer { inner }
    }
}

#[async_trait]
impl<S: DataService> proto::data_server::Data for GrpcServer<S> {
    async fn process(
        &self,
        request: Request<proto::Envelope>,
    ) -> Result<Response<proto::Envelope>, Status> {
        let req = decode_envelope(&request.into_inner())?;
        debug!(id = %req.id, endpoint = %req.effective_endpoint(), "data: process");
        let resp = self.inner.process(req).await.map_err(error_to_status)?;
        Ok(Response::new(encode_envelope(&resp)?))
    }

    async fn endpoint_discovery(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::SchemaMapResponse>, Status> {
        let schema_json = serde_json::to_string(&self.inner.schema_map())
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::SchemaMapResponse { schema_json }))
    }

    async fn health(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::HealthStatus>, Status> {
        let detail = match self.inner.is_leader() {
            Some(true) => "leader".to_string(),
            Some(false) => "follower".to_string(),
            None => String::new(),
        };
        Ok(Response::new(proto::HealthStatus {
            serving: self.inner.serving(),
            detail,
        }))
    }
}

/// Binds a listener, returning the actual bound address (`port = 0` requests
/// an OS-assigned port).
pub async fn bind(addr: &str) -> anyhow::Result<(SocketAddr, TcpListener)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((local, listener))
}

/// Serves the `Data` service on the given listener until the process exits
/// or the task is aborted.
pub async fn serve_data<S: DataService>(
    listener: TcpListener,
    service: Arc<S>,
) -> anyhow::Result<()> {
    Server::builder()
        .add_service(proto::data_server::DataServer::new(GrpcServer::new(service)))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;
    Ok(())
}

/// Wraps a request into a proto envelope in the binary wire encoding.
pub fn encode_envelope(req: &DataRequest) -> Result<proto::Envelope, Status> {
    let payload = wire::encode(req).map_err(error_to_status)?;
    Ok(proto::Envelope {
        payload: payload.to_vec(),
    })
}

/// Unwraps a proto envelope back into a request.
pub fn decode_envelope(envelope: &proto::Envelope) -> Result<DataRequest, Status> {
    wire::decode(&envelope.payload).map_err(error_to_status)
}

/// Maps a runtime error onto a gRPC status. The error is carried JSON-encoded
/// in the status message so peers can reconstruct it losslessly.
pub fn error_to_status(err: Error) -> Status {
    let code = match err.kind {
        ErrorKind::InvalidInput => Code::InvalidArgument,
        ErrorKind::NoSuchEndpoint => Code::NotFound,
        ErrorKind::SchemaMismatch => Code::FailedPrecondition,
        ErrorKind::Cancelled => Code::Cancelled,
        ErrorKind::Unavailable => Code::Unavailable,
        ErrorKind::Internal | ErrorKind::Chained => Code::Internal,
    };
    let message = serde_json::to_string(&err).unwrap_or(err.message);
    Status::new(code, message)
}

/// Reconstructs a runtime error from a gRPC status, attributing transport
/// failures to `node`.
pub fn status_to_error(status: &Status, node: &str) -> Error {
    if let Ok(err) = serde_json::from_str::<Error>(status.message()) {
        return err;
    }
    let kind = match status.code() {
        Code::InvalidArgument => ErrorKind::InvalidInput,
        Code::NotFound => ErrorKind::NoSuchEndpoint,
        Code::FailedPrecondition => ErrorKind::SchemaMismatch,
        Code::Cancelled | Code::DeadlineExceeded => ErrorKind::Cancelled,
        Code::Unavailable => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    };
    Error::new(kind, node, status.message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_error() {
        let err = Error::no_such_endpoint("worker0", "/nope");
        let status = error_to_status(err.clone());
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status_to_error(&status, "pool"), err);
    }

    #[test]
    fn foreign_status_maps_by_code() {
        let status = Status::unavailable("connection refused");
        let err = status_to_error(&status, "pool");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.node, "pool");
    }
}
