// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client-facing gateway.
//!
//! The gateway terminates the three external protocols (gRPC, HTTP/JSON,
//! WebSocket), validates requests, drives them through the compiled graph,
//! and streams ordered responses back. It is stateless with respect to
//! in-flight requests: clients retry across gateway restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{info, warn};

use flow_repr::schema::SchemaMap;
use flow_repr::ErrorStrategy;
use flow_service::pool::ConnectionPool;
use flow_service::proto::gateway_server::GatewayServer;
use flow_topology::CompiledFlow;

pub mod graph;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod streamer;

use graph::GraphDriver;
use grpc::GrpcGateway;
use metrics::GatewayMetrics;
use streamer::RequestStreamer;

/// Gateway configuration, distilled from the flow description and launcher
/// flags.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub flow: CompiledFlow,
    pub on_error: ErrorStrategy,
    pub prefetch: usize,
    pub results_in_order: bool,
    pub timeout_send: Option<Duration>,
    /// How long shutdown waits for in-flight calls.
    pub grace_period: Duration,
    /// How long start-up discovery waits for each node to answer.
    pub discovery_wait: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            flow: CompiledFlow::default(),
            on_error: ErrorStrategy::ThrowEarly,
            prefetch: 0,
            results_in_order: true,
            timeout_send: None,
            grace_period: Duration::from_secs(10),
            discovery_wait: Duration::from_secs(30),
        }
    }
}

/// A started gateway, ready to serve.
pub struct Gateway {
    streamer: RequestStreamer,
    schemas: SchemaMap,
    pool: Arc<ConnectionPool>,
    metrics: GatewayMetrics,
    grace_period: Duration,
}

impl Gateway {
    /// Builds the graph driver and performs start-up endpoint discovery
    /// against every node. Discovery failure is a start-up failure: the
    /// topology promised an address that never answered.
    pub async fn start(
        config: GatewayConfig,
        pool: Arc<ConnectionPool>,
        registry: &prometheus::Registry,
    ) -> anyhow::Result<Gateway> {
        let driver = Arc::new(GraphDriver::new(
            config.flow.clone(),
            Arc::clone(&pool) as Arc<dyn graph::Dispatch>,
            config.on_error,
            config.timeout_send,
        )?);

        let mut schemas = SchemaMap::new();
        for (node, addresses) in &config.flow.addresses {
            let Some(address) = addresses.first() else {
                continue;
            };
            let map = pool
                .discover(address, config.discovery_wait)
                .await
                .with_context(|| format!("endpoint discovery of {node} at {address}"))?;
            driver.set_endpoints(node, map.keys().cloned().collect());
            for (endpoint, schema) in map {
                schemas.entry(endpoint).or_insert(schema);
            }
            info!(node = %node, "gateway: discovered node endpoints");
        }

        let metrics = GatewayMetrics::register(registry);
        let streamer = RequestStreamer::new(driver, config.prefetch, config.results_in_order);
        Ok(Gateway {
            streamer,
            schemas,
            pool,
            metrics,
            grace_period: config.grace_period,
        })
    }

    /// The streamer, for embedding the gateway without network frontends.
    pub fn streamer(&self) -> &RequestStreamer {
        &self.streamer
    }

    /// The aggregated schema map.
    pub fn schemas(&self) -> &SchemaMap {
        &self.schemas
    }

    /// Serves gRPC and HTTP/WebSocket until `shutdown` resolves, then waits
    /// up to the grace period for in-flight calls and closes the pool.
    pub async fn serve<F>(
        self,
        grpc_listener: TcpListener,
        http_listener: TcpListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown = shutdown.shared();

        let grpc_service = GrpcGateway::new(
            self.streamer.clone(),
            self.schemas.clone(),
            self.metrics.clone(),
        );
        let grpc_task = flow_ore::task::spawn(|| "gateway-grpc", {
            let shutdown = shutdown.clone();
            tonic::transport::Server::builder()
                .add_service(GatewayServer::new(grpc_service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(grpc_listener), shutdown)
        });

        let http_state = Arc::new(http::HttpState {
            streamer: self.streamer.clone(),
            schemas: self.schemas.clone(),
            metrics: self.metrics.clone(),
        });
        let http_listener = http_listener.into_std()?;
        let http_task = flow_ore::task::spawn(|| "gateway-http", {
            let shutdown = shutdown.clone();
            async move {
                axum::Server::from_tcp(http_listener)?
                    .serve(http::router(http_state).into_make_service())
                    .with_graceful_shutdown(shutdown)
                    .await?;
                Ok::<_, anyhow::Error>(())
            }
        });

        info!("gateway: serving");
        shutdown.await;
        info!("gateway: draining in-flight calls");
        let drain = async {
            let (grpc, http) = tokio::join!(grpc_task, http_task);
            if let Err(e) = grpc.map_err(anyhow::Error::from).and_then(|r| r.map_err(Into::into)) {
                warn!("gateway: grpc server error: {e}");
            }
            if let Err(e) = http.map_err(anyhow::Error::from).and_then(|r| r) {
                warn!("gateway: http server error: {e}");
            }
        };
        if tokio::time::timeout(self.grace_period, drain).await.is_err() {
            warn!("gateway: grace period elapsed with calls still in flight");
        }
        self.pool.close_all();
        info!("gateway: shut down");
        Ok(())
    }
}
