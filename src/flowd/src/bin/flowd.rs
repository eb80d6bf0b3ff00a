// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The uniform flowd launcher.
//!
//! One binary serves all three roles: `--pea-role GATEWAY` terminates the
//! client protocols and drives the compiled graph, `--pea-role HEAD` fronts
//! one deployment's workers, `--pea-role WORKER` hosts one executor replica
//! (optionally inside a consensus group when `--stateful`).
//!
//! Exit codes: 0 clean shutdown, 1 start-up failure, 2 configuration error,
//! 3 irrecoverable runtime crash.

use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use flow_consensus::service::ConsensusService;
use flow_consensus::{ConsensusGroup, RaftSettings, StatefulWorker};
use flow_executor::plugin::PluginRegistry;
use flow_executor::testing::{
    AppendExecutor, ConcatMergerExecutor, CounterExecutor, IdentityExecutor, TagShardExecutor,
};
use flow_executor::ExecutorConfig;
use flow_gateway::{Gateway, GatewayConfig};
use flow_head::{HeadConfig, HeadRuntime};
use flow_repr::value::json_to_value;
use flow_repr::{ErrorStrategy, Value};
use flow_service::grpc as service_grpc;
use flow_service::pool::{ConnectionPool, PoolOptions};
use flow_topology::{
    compile, CompiledFlow, DeploymentAddresses, FlowSpec, NodeMeta, Polling, PollingMode,
};
use flow_worker::WorkerRuntime;

/// The role a flowd process plays in a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "UPPER")]
enum PeaRole {
    Gateway,
    Head,
    Worker,
}

/// Uniform launcher for every flowd component.
#[derive(Parser, Debug)]
#[clap(name = "flowd", version)]
struct Args {
    /// The node name, used in routes and logs.
    #[clap(long, env = "FLOWD_NAME", default_value = "flowd")]
    name: String,

    /// The role of this process.
    #[clap(long, env = "FLOWD_PEA_ROLE", value_enum, default_value = "GATEWAY")]
    pea_role: PeaRole,

    /// Bind host; falls back to $DEFAULT_HOST, then 127.0.0.1.
    #[clap(long, env = "FLOWD_HOST")]
    host: Option<String>,

    /// Bind port for the primary surface (gRPC); 0 asks the OS.
    #[clap(long, env = "FLOWD_PORT", default_value = "0")]
    port: u16,

    /// HTTP/WebSocket port of the gateway; 0 asks the OS.
    #[clap(long, env = "FLOWD_PORT_HTTP", default_value = "0")]
    port_http: u16,

    /// A full flow description (JSON) to compile at start-up. Gateway only;
    /// mutually exclusive with --graph-description.
    #[clap(long, env = "FLOWD_FLOW_DESCRIPTION", value_name = "JSON")]
    flow_description: Option<String>,

    /// A precompiled graph map (JSON), as produced by the topology compiler.
    #[clap(long, env = "FLOWD_GRAPH_DESCRIPTION", value_name = "JSON")]
    graph_description: Option<String>,

    /// Node name → address list (JSON).
    #[clap(long, env = "FLOWD_DEPLOYMENTS_ADDRESSES", value_name = "JSON")]
    deployments_addresses: Option<String>,

    /// Node name → routing metadata (JSON).
    #[clap(long, env = "FLOWD_DEPLOYMENTS_METADATA", value_name = "JSON")]
    deployments_metadata: Option<String>,

    /// Worker/head wiring of this deployment (JSON), `{head, shards}`.
    #[clap(long, env = "FLOWD_DEPLOYMENT_WIRING", value_name = "JSON")]
    deployment_wiring: Option<String>,

    /// Runtime class override; reserved for custom runtimes.
    #[clap(long, env = "FLOWD_RUNTIME_CLS")]
    runtime_cls: Option<String>,

    /// Executor reference, resolved through the plugin registry.
    #[clap(long, env = "FLOWD_USES")]
    uses: Option<String>,

    /// Executor construction parameters (JSON map).
    #[clap(long, env = "FLOWD_USES_WITH", value_name = "JSON")]
    uses_with: Option<String>,

    /// Executor instance-name override.
    #[clap(long, env = "FLOWD_USES_METAS")]
    uses_metas: Option<String>,

    /// Wrapper executor run by the head before fan-out.
    #[clap(long, env = "FLOWD_USES_BEFORE")]
    uses_before: Option<String>,

    /// Wrapper executor run by the head after merging.
    #[clap(long, env = "FLOWD_USES_AFTER")]
    uses_after: Option<String>,

    #[clap(long, env = "FLOWD_REPLICAS", default_value = "1")]
    replicas: usize,

    #[clap(long, env = "FLOWD_SHARDS", default_value = "1")]
    shards: usize,

    /// Shard polling: ANY, ALL, or a JSON endpoint map.
    #[clap(long, env = "FLOWD_POLLING")]
    polling: Option<String>,

    /// Concatenate fan-in responses instead of merging them.
    #[clap(long, env = "FLOWD_DISABLE_REDUCE")]
    disable_reduce: bool,

    /// Replicate write endpoints through a consensus group.
    #[clap(long, env = "FLOWD_STATEFUL")]
    stateful: bool,

    /// Consensus settings (JSON), required with --stateful.
    #[clap(long, env = "FLOWD_RAFT_CONFIGURATION", value_name = "JSON")]
    raft_configuration: Option<String>,

    /// Per-send deadline toward downstream nodes, in milliseconds.
    #[clap(long, env = "FLOWD_TIMEOUT_SEND", value_name = "MS")]
    timeout_send: Option<u64>,

    /// Maximum in-flight requests per client call; 0 means uncapped.
    #[clap(long, env = "FLOWD_PREFETCH", default_value = "0")]
    prefetch: usize,

    /// Emit responses in submission order (pass `false` to allow
    /// out-of-order completion for lower tail latency).
    #[clap(
        long,
        env = "FLOWD_RESULTS_IN_ORDER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    results_in_order: bool,

    /// Error strategy: THROW_EARLY, SKIP_HANDLE, or SKIP_EXECUTOR.
    #[clap(long, env = "FLOWD_ON_ERROR", default_value = "THROW_EARLY")]
    on_error: String,

    /// Tracing filter override; $LOG_LEVEL applies otherwise.
    #[clap(long, env = "FLOWD_LOG_CONFIG")]
    log_config: Option<String>,

    /// Serve /metrics and /livez on the monitoring port.
    #[clap(long, env = "FLOWD_MONITORING")]
    monitoring: bool,

    #[clap(long, env = "FLOWD_PORT_MONITORING", default_value = "0")]
    port_monitoring: u16,
}

/// A fatal error carrying the process exit code.
struct Fatal {
    code: i32,
    error: anyhow::Error,
}

trait FatalExt<T> {
    /// Classifies an error as a start-up failure (exit 1).
    fn or_startup(self) -> Result<T, Fatal>;
    /// Classifies an error as a configuration error (exit 2).
    fn or_config(self) -> Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> FatalExt<T> for Result<T, E> {
    fn or_startup(self) -> Result<T, Fatal> {
        self.map_err(|e| Fatal {
            code: 1,
            error: e.into(),
        })
    }

    fn or_config(self) -> Result<T, Fatal> {
        self.map_err(|e| Fatal {
            code: 2,
            error: e.into(),
        })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = args
        .log_config
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => process::exit(0),
        Err(fatal) => {
            eprintln!("flowd: fatal: {:#}", fatal.error);
            process::exit(fatal.code);
        }
    }
}

/// Built-in executors every flowd process links. Library embedders register
/// their own factories before launching.
fn builtin_plugins() -> PluginRegistry {
    let registry = PluginRegistry::new();
    registry.register("identity", |_config| Ok(Arc::new(IdentityExecutor)));
    registry.register("append", |config| {
        Ok(Arc::new(AppendExecutor::from_config(&config)))
    });
    registry.register("tag-shard", |config| {
        Ok(Arc::new(TagShardExecutor::from_config(&config)))
    });
    registry.register("concat-merger", |_config| Ok(Arc::new(ConcatMergerExecutor)));
    registry.register("counter", |_config| Ok(Arc::new(CounterExecutor::new())));
    registry
}

async fn run(args: Args) -> Result<(), Fatal> {
    let host = args
        .host
        .clone()
        .or_else(|| std::env::var("DEFAULT_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".into());

    if args.monitoring {
        serve_monitoring(&host, args.port_monitoring).await?;
    }
    if let Some(cls) = &args.runtime_cls {
        // Role selection drives the runtime; the override exists for
        // embedders that dispatch on it themselves.
        tracing::debug!(runtime_cls = %cls, "flowd: runtime class requested");
    }

    info!(name = %args.name, role = ?args.pea_role, "flowd: starting");
    match args.pea_role {
        PeaRole::Gateway => run_gateway(args, host).await,
        PeaRole::Head => run_head(args, host).await,
        PeaRole::Worker => run_worker(args, host).await,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    flag: &str,
    value: &Option<String>,
) -> Result<Option<T>, Fatal> {
    match value {
        None => Ok(None),
        Some(json) => serde_json::from_str(json)
            .with_context(|| format!("unparsable {flag}"))
            .map(Some)
            .or_config(),
    }
}

fn parse_on_error(value: &str) -> Result<ErrorStrategy, Fatal> {
    match value {
        "THROW_EARLY" => Ok(ErrorStrategy::ThrowEarly),
        "SKIP_HANDLE" => Ok(ErrorStrategy::SkipHandle),
        "SKIP_EXECUTOR" => Ok(ErrorStrategy::SkipExecutor),
        other => Err(anyhow::anyhow!("unknown error strategy {other}")).or_config(),
    }
}

fn parse_polling(value: &Option<String>) -> Result<Polling, Fatal> {
    match value.as_deref() {
        None | Some("ANY") => Ok(Polling::Single(PollingMode::Any)),
        Some("ALL") => Ok(Polling::Single(PollingMode::All)),
        Some(json) => serde_json::from_str(json)
            .context("unparsable --polling")
            .or_config(),
    }
}

fn uses_with_map(args: &Args) -> Result<BTreeMap<String, Value>, Fatal> {
    let Some(parsed) = parse_json::<serde_json::Value>("--uses-with", &args.uses_with)? else {
        return Ok(BTreeMap::new());
    };
    match json_to_value(&parsed) {
        Value::Map(map) => Ok(map),
        _ => Err(anyhow::anyhow!("--uses-with must be a JSON object")).or_config(),
    }
}

/// Builds the executor named by `--uses`.
fn build_executor(
    args: &Args,
    plugins: &PluginRegistry,
) -> Result<(String, Arc<dyn flow_executor::Executor>), Fatal> {
    let uses = args
        .uses
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--uses is required for this role"))
        .or_config()?;
    let instance_name = args.uses_metas.clone().unwrap_or_else(|| args.name.clone());
    let config = ExecutorConfig {
        name: instance_name.clone(),
        with: uses_with_map(args)?,
        workspace: None,
    };
    let executor = plugins.build(&uses, config).or_startup()?;
    Ok((instance_name, executor))
}

async fn run_worker(args: Args, host: String) -> Result<(), Fatal> {
    let plugins = builtin_plugins();
    let (instance_name, executor) = build_executor(&args, &plugins)?;
    let runtime = Arc::new(WorkerRuntime::new(instance_name, executor));

    let (addr, listener) = service_grpc::bind(&format!("{host}:{}", args.port))
        .await
        .or_startup()?;
    info!(%addr, "worker: serving data service");

    if args.stateful {
        let raft_json = args
            .raft_configuration
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--stateful requires --raft-configuration"))
            .or_config()?;
        let settings = RaftSettings::from_json(raft_json)
            .context("unparsable --raft-configuration")
            .or_config()?;
        let group = ConsensusGroup::start(Arc::clone(&runtime), settings.clone())
            .await
            .or_startup()?;

        let (raft_addr, raft_listener) = service_grpc::bind(&settings.address)
            .await
            .or_startup()?;
        info!(%raft_addr, "worker: serving raft service");
        flow_ore::task::spawn(|| "raft-service", {
            let group = Arc::clone(&group);
            async move {
                if let Err(e) = ConsensusService::serve(group, raft_listener).await {
                    tracing::error!("raft service failed: {e}");
                }
            }
        });
        group.join_or_bootstrap().await.or_startup()?;

        let worker = Arc::new(StatefulWorker::new(Arc::clone(&group)));
        let serve = flow_ore::task::spawn(
            || "data-service",
            service_grpc::serve_data(listener, worker),
        );
        wait_for_shutdown().await;
        group.shutdown().await;
        runtime.close().await;
        serve.abort();
    } else {
        let serve = flow_ore::task::spawn(
            || "data-service",
            service_grpc::serve_data(listener, Arc::clone(&runtime)),
        );
        wait_for_shutdown().await;
        runtime.close().await;
        serve.abort();
    }
    info!("worker: shut down");
    Ok(())
}

async fn run_head(args: Args, host: String) -> Result<(), Fatal> {
    let plugins = builtin_plugins();

    // The head serves the worker executor's schemas through discovery; build
    // a probe instance to read the endpoint table.
    let (_, probe) = build_executor(&args, &plugins)?;
    let schema_map = WorkerRuntime::new(&args.name, probe).registry().schema_map();

    let wiring: DeploymentAddresses = parse_json("--deployment-wiring", &args.deployment_wiring)?
        .ok_or_else(|| anyhow::anyhow!("--deployment-wiring is required for the head role"))
        .or_config()?;

    let build_wrapper = |uses: &Option<String>| -> Result<Option<Arc<WorkerRuntime>>, Fatal> {
        match uses {
            None => Ok(None),
            Some(name) => {
                let config = ExecutorConfig {
                    name: name.clone(),
                    ..Default::default()
                };
                let executor = plugins.build(name, config).or_startup()?;
                Ok(Some(Arc::new(WorkerRuntime::new(name, executor))))
            }
        }
    };

    let pool = Arc::new(ConnectionPool::new(PoolOptions::default()));
    let head = Arc::new(HeadRuntime::new(
        HeadConfig {
            name: args.name.clone(),
            shards: wiring.shards.clone(),
            polling: parse_polling(&args.polling)?,
            disable_reduce: args.disable_reduce,
            stateful: args.stateful,
            timeout_send: args.timeout_send.map(Duration::from_millis),
            schema_map,
        },
        pool,
        build_wrapper(&args.uses_before)?,
        build_wrapper(&args.uses_after)?,
    ));

    let (addr, listener) = service_grpc::bind(&format!("{host}:{}", args.port))
        .await
        .or_startup()?;
    info!(%addr, shards = wiring.shards.len(), "head: serving");
    let serve = flow_ore::task::spawn(|| "head-service", service_grpc::serve_data(listener, head));
    wait_for_shutdown().await;
    serve.abort();
    info!("head: shut down");
    Ok(())
}

async fn run_gateway(args: Args, host: String) -> Result<(), Fatal> {
    let flow = if let Some(spec_json) = &args.flow_description {
        let spec = FlowSpec::from_json(spec_json)
            .context("unparsable --flow-description")
            .or_config()?;
        compile(&spec, &host).or_startup()?
    } else {
        let graph = parse_json("--graph-description", &args.graph_description)?
            .ok_or_else(|| {
                anyhow::anyhow!("the gateway needs --flow-description or --graph-description")
            })
            .or_config()?;
        let addresses = parse_json("--deployments-addresses", &args.deployments_addresses)?
            .ok_or_else(|| anyhow::anyhow!("--deployments-addresses is required"))
            .or_config()?;
        let metadata: BTreeMap<String, NodeMeta> =
            parse_json("--deployments-metadata", &args.deployments_metadata)?.unwrap_or_default();
        CompiledFlow {
            graph,
            addresses,
            metadata,
            internal: BTreeMap::new(),
        }
    };

    let pool = Arc::new(ConnectionPool::new(PoolOptions {
        timeout: args
            .timeout_send
            .map(Duration::from_millis)
            .unwrap_or(PoolOptions::default().timeout),
        ..Default::default()
    }));
    let registry = prometheus::default_registry();
    let gateway = Gateway::start(
        GatewayConfig {
            flow,
            on_error: parse_on_error(&args.on_error)?,
            prefetch: args.prefetch,
            results_in_order: args.results_in_order,
            timeout_send: args.timeout_send.map(Duration::from_millis),
            ..Default::default()
        },
        pool,
        registry,
    )
    .await
    .or_startup()?;

    let (grpc_addr, grpc_listener) = service_grpc::bind(&format!("{host}:{}", args.port))
        .await
        .or_startup()?;
    let (http_addr, http_listener) = service_grpc::bind(&format!("{host}:{}", args.port_http))
        .await
        .or_startup()?;
    info!(%grpc_addr, %http_addr, "gateway: serving");

    gateway
        .serve(grpc_listener, http_listener, wait_for_shutdown())
        .await
        .map_err(|e| Fatal { code: 3, error: e })?;
    Ok(())
}

/// Resolves when the process receives SIGINT.
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("flowd: shutdown signal received");
}

/// Serves /metrics and /livez on the monitoring port.
async fn serve_monitoring(host: &str, port: u16) -> Result<(), Fatal> {
    use axum::routing::get;
    let (addr, listener) = service_grpc::bind(&format!("{host}:{port}"))
        .await
        .or_startup()?;
    info!(%addr, "flowd: serving monitoring endpoints");
    let app = axum::Router::new()
        .route("/livez", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(|| async {
                let metrics = prometheus::default_registry().gather();
                prometheus::TextEncoder::new()
                    .encode_to_string(&metrics)
                    .unwrap_or_default()
            }),
        );
    let listener = listener.into_std().or_startup()?;
    flow_ore::task::spawn(|| "monitoring", async move {
        if let Err(e) = axum::Server::from_tcp(listener)
            .expect("listener is valid")
            .serve(app.into_make_service())
            .await
        {
            tracing::error!("monitoring server failed: {e}");
        }
    });
    Ok(())
}
