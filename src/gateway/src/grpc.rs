// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The gRPC surface of the gateway: bidirectional streaming `Call`,
//! endpoint discovery, and health.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use flow_repr::schema::SchemaMap;
use flow_repr::{DataRequest, ErrorStrategy};
use flow_service::grpc::{decode_envelope, encode_envelope, error_to_status};
use flow_service::proto;

use crate::metrics::GatewayMetrics;
use crate::streamer::RequestStreamer;

/// The streaming response type of `Call`.
pub type CallStream = Pin<Box<dyn Stream<Item = Result<proto::Envelope, Status>> + Send>>;

/// Implements the client-facing `Gateway` service.
pub struct GrpcGateway {
    streamer: RequestStreamer,
    schemas: SchemaMap,
    metrics: GatewayMetrics,
}

impl GrpcGateway {
    pub fn new(
        streamer: RequestStreamer,
        schemas: SchemaMap,
        metrics: GatewayMetrics,
    ) -> GrpcGateway {
        GrpcGateway {
            streamer,
            schemas,
            metrics,
        }
    }
}

/// Maps a final response onto the wire: responses whose routes carry a
/// failure become a non-OK status under `THROW_EARLY`, with the routes table
/// in the status message.
pub fn response_to_message(
    resp: DataRequest,
    on_error: ErrorStrategy,
) -> Result<proto::Envelope, Status> {
    if on_error == ErrorStrategy::ThrowEarly {
        if let Some(route) = resp.first_failure() {
            let detail = serde_json::json!({
                "error": route.error,
                "routes": resp.routes,
            });
            let code = route
                .error
                .as_ref()
                .map(|e| error_to_status(e.clone()).code())
                .unwrap_or(tonic::Code::Internal);
            return Err(Status::new(code, detail.to_string()));
        }
    }
    encode_envelope(&resp)
}

#[async_trait]
impl proto::gateway_server::Gateway for GrpcGateway {
    type CallStream = CallStream;

    async fn call(
        &self,
        request: Request<Streaming<proto::Envelope>>,
    ) -> Result<Response<Self::CallStream>, Status> {
        debug!("gateway: client call opened");
        let metrics = self.metrics.clone();
        let on_error = self.streamer.driver().on_error();

        // Undecodable envelopes poison the call: the stream errors out.
        let requests = request.into_inner().filter_map(|item| async move {
            match item {
                Ok(envelope) => decode_envelope(&envelope).ok(),
                Err(_) => None,
            }
        });
        let responses = self
            .streamer
            .stream(requests)
            .map(move |result| {
                metrics.observe(&result);
                match result {
                    Ok(resp) => response_to_message(resp, on_error),
                    Err(err) => Err(error_to_status(err)),
                }
            })
            .boxed();
        Ok(Response::new(responses))
    }

    async fn endpoint_discovery(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::SchemaMapResponse>, Status> {
        let schema_json = serde_json::to_string(&self.schemas)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::SchemaMapResponse { schema_json }))
    }

    async fn health_check(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::HealthStatus>, Status> {
        Ok(Response::new(proto::HealthStatus {
            serving: true,
            detail: String::new(),
        }))
    }
}
