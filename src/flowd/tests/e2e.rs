// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end flow scenarios over real gRPC transport: in-process workers,
//! heads, consensus groups, and a gateway wired through the connection pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flow_consensus::service::ConsensusService;
use flow_consensus::{ConsensusGroup, RaftSettings, StatefulWorker};
use flow_executor::testing::{
    AppendExecutor, ConcatMergerExecutor, CounterExecutor, TagShardExecutor,
};
use flow_executor::{Executor, ExecutorConfig};
use flow_gateway::{Gateway, GatewayConfig};
use flow_head::{HeadConfig, HeadRuntime};
use flow_repr::request::DEFAULT_ENDPOINT;
use flow_repr::{DataRequest, DocBatch, Document, Value};
use flow_service::grpc::{bind, serve_data};
use flow_service::pool::ConnectionPool;
use flow_service::DataService;
use flow_topology::{
    CompiledFlow, NodeMeta, Polling, PollingMode, GATEWAY_END, GATEWAY_START,
};
use flow_worker::WorkerRuntime;

/// Serves a data service on an ephemeral port and returns its address.
async fn serve<S: DataService>(service: Arc<S>) -> String {
    let (addr, listener) = bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(serve_data(listener, service));
    addr.to_string()
}

async fn serve_worker(name: &str, executor: Arc<dyn Executor>) -> String {
    serve(Arc::new(WorkerRuntime::new(name, executor))).await
}

/// Hand-assembles a compiled flow from edges, addresses, and metadata.
fn flow_of(
    edges: &[(&str, &str)],
    addresses: &[(&str, &str)],
    metadata: &[(&str, NodeMeta)],
) -> CompiledFlow {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    graph.insert(GATEWAY_START.to_string(), Vec::new());
    graph.insert(GATEWAY_END.to_string(), Vec::new());
    for (from, to) in edges {
        graph
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        graph.entry(to.to_string()).or_default();
    }
    let mut meta_map: BTreeMap<String, NodeMeta> = metadata
        .iter()
        .map(|(n, m)| (n.to_string(), m.clone()))
        .collect();
    for node in graph.keys() {
        if node != GATEWAY_START && node != GATEWAY_END {
            meta_map.entry(node.clone()).or_default();
        }
    }
    CompiledFlow {
        graph,
        addresses: addresses
            .iter()
            .map(|(n, a)| (n.to_string(), vec![a.to_string()]))
            .collect(),
        metadata: meta_map,
        internal: BTreeMap::new(),
    }
}

async fn start_gateway(flow: CompiledFlow) -> Gateway {
    let config = GatewayConfig {
        flow,
        discovery_wait: Duration::from_secs(10),
        ..Default::default()
    };
    Gateway::start(
        config,
        Arc::new(ConnectionPool::default()),
        &prometheus::Registry::new(),
    )
    .await
    .unwrap()
}

fn text_request(endpoint: &str, docs: &[(&str, &str)]) -> DataRequest {
    DataRequest::new(
        endpoint,
        docs.iter().map(|(id, t)| Document::text(*id, *t)).collect(),
    )
}

#[tokio::test]
async fn linear_flow_single_executor_adds_text() {
    let worker = serve_worker(
        "greeter",
        Arc::new(AppendExecutor::new("/foo", "Hello World!")),
    )
    .await;
    let gateway = start_gateway(flow_of(
        &[(GATEWAY_START, "greeter"), ("greeter", GATEWAY_END)],
        &[("greeter", &worker)],
        &[],
    ))
    .await;

    let resp = gateway
        .streamer()
        .execute(text_request("/foo", &[("a", "")]))
        .await
        .unwrap();
    assert_eq!(resp.docs.len(), 1);
    assert_eq!(resp.docs[0].id, "a");
    assert_eq!(resp.docs[0].text_content(), Some("Hello World!"));
    assert!(resp.first_failure().is_none());
}

#[tokio::test]
async fn two_deployment_chain_appends_in_order() {
    let enc = serve_worker("enc", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, " enc"))).await;
    let dec = serve_worker("dec", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, " dec"))).await;
    let gateway = start_gateway(flow_of(
        &[
            (GATEWAY_START, "enc"),
            ("enc", "dec"),
            ("dec", GATEWAY_END),
        ],
        &[("enc", &enc), ("dec", &dec)],
        &[],
    ))
    .await;

    let resp = gateway
        .streamer()
        .execute(text_request("/foo", &[("x", "hi")]))
        .await
        .unwrap();
    assert_eq!(resp.docs[0].text_content(), Some("hi enc dec"));
}

#[tokio::test]
async fn bifurcation_with_merger_concatenates_branches() {
    let a = serve_worker("a", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, "A"))).await;
    let b = serve_worker("b", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, "B"))).await;
    let merger = serve_worker("merger", Arc::new(ConcatMergerExecutor)).await;
    let gateway = start_gateway(flow_of(
        &[
            (GATEWAY_START, "a"),
            (GATEWAY_START, "b"),
            ("a", "merger"),
            ("b", "merger"),
            ("merger", GATEWAY_END),
        ],
        &[("a", &a), ("b", &b), ("merger", &merger)],
        &[(
            "merger",
            NodeMeta {
                disable_reduce: true,
                ..Default::default()
            },
        )],
    ))
    .await;

    let resp = gateway
        .streamer()
        .execute(text_request("/foo", &[("1", "")]))
        .await
        .unwrap();
    assert_eq!(resp.docs.len(), 1);
    assert_eq!(resp.docs[0].text_content(), Some("AB"));
}

#[tokio::test]
async fn sharded_deployment_with_all_polling_merges_tags() {
    let mut shard_addrs = Vec::new();
    for shard_id in 0..2 {
        let executor = TagShardExecutor::from_config(&ExecutorConfig {
            with: [("shard_id".to_string(), Value::Int(shard_id))].into(),
            ..Default::default()
        });
        shard_addrs.push(vec![
            serve_worker(&format!("shard{shard_id}"), Arc::new(executor)).await,
        ]);
    }
    let schema_map = {
        let probe = WorkerRuntime::new("probe", Arc::new(ConcatMergerExecutor));
        probe.registry().schema_map()
    };
    let head = Arc::new(HeadRuntime::new(
        HeadConfig {
            name: "sharded".into(),
            shards: shard_addrs,
            polling: Polling::Single(PollingMode::All),
            disable_reduce: false,
            stateful: false,
            timeout_send: None,
            schema_map,
        },
        Arc::new(ConnectionPool::default()),
        None,
        None,
    ));
    let head_addr = serve(head).await;

    let gateway = start_gateway(flow_of(
        &[(GATEWAY_START, "sharded"), ("sharded", GATEWAY_END)],
        &[("sharded", &head_addr)],
        &[],
    ))
    .await;

    let resp = gateway
        .streamer()
        .execute(text_request("/foo", &[("1", "")]))
        .await
        .unwrap();
    assert_eq!(resp.docs.len(), 1);
    match &resp.docs[0].tags["seen"] {
        Value::List(seen) => {
            let mut ids: Vec<i64> = seen
                .iter()
                .map(|v| match v {
                    Value::Int(i) => *i,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            ids.sort();
            assert_eq!(ids, vec![0, 1]);
        }
        other => panic!("unexpected seen tag {other:?}"),
    }
}

#[tokio::test]
async fn conditional_routing_sends_each_document_one_way() {
    let one = serve_worker("exec1", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, "one"))).await;
    let two = serve_worker("exec2", Arc::new(AppendExecutor::new(DEFAULT_ENDPOINT, "two"))).await;
    let joiner = serve_worker("joiner", Arc::new(ConcatMergerExecutor)).await;
    let when = |n: i64| NodeMeta {
        when: Some(serde_json::json!({"tags.type": {"$eq": n}})),
        ..Default::default()
    };
    let gateway = start_gateway(flow_of(
        &[
            (GATEWAY_START, "exec1"),
            (GATEWAY_START, "exec2"),
            ("exec1", "joiner"),
            ("exec2", "joiner"),
            ("joiner", GATEWAY_END),
        ],
        &[("exec1", &one), ("exec2", &two), ("joiner", &joiner)],
        &[("exec1", when(1)), ("exec2", when(2))],
    ))
    .await;

    let mut doc_a = Document::with_id("a");
    doc_a.tags.insert("type".into(), Value::Int(1));
    let mut doc_b = Document::with_id("b");
    doc_b.tags.insert("type".into(), Value::Int(2));
    let req = DataRequest::new("/foo", DocBatch(vec![doc_a, doc_b]));
    let resp = gateway.streamer().execute(req).await.unwrap();

    let by_id: BTreeMap<&str, &str> = resp
        .docs
        .iter()
        .map(|d| (d.id.as_str(), d.text_content().unwrap_or("")))
        .collect();
    assert_eq!(by_id["a"], "one");
    assert_eq!(by_id["b"], "two");
}

/// One consensus replica with its raft and data services running.
struct Replica {
    group: Arc<ConsensusGroup>,
    data_addr: String,
    raft_task: tokio::task::JoinHandle<()>,
}

async fn start_cluster(dirs: &[tempfile::TempDir; 3]) -> Vec<Replica> {
    // Reserve raft addresses first so every replica knows its peers.
    let mut raft_binds = Vec::new();
    for _ in 0..3 {
        raft_binds.push(bind("127.0.0.1:0").await.unwrap());
    }
    let peers: BTreeMap<u64, String> = raft_binds
        .iter()
        .enumerate()
        .map(|(i, (addr, _))| (i as u64 + 1, addr.to_string()))
        .collect();

    let mut replicas = Vec::new();
    for (i, (raft_addr, raft_listener)) in raft_binds.into_iter().enumerate() {
        let id = i as u64 + 1;
        let runtime = Arc::new(WorkerRuntime::new(
            format!("counter{id}"),
            Arc::new(CounterExecutor::new()),
        ));
        let settings = RaftSettings {
            replica_id: id,
            bootstrap: id == 1,
            peers: peers.clone(),
            address: raft_addr.to_string(),
            state_dir: dirs[i].path().to_path_buf(),
            snapshot_threshold: 1000,
            trailing_logs: 64,
            heartbeat_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
        };
        let group = ConsensusGroup::start(runtime, settings).await.unwrap();
        let raft_task = tokio::spawn({
            let group = Arc::clone(&group);
            async move {
                let _ = ConsensusService::serve(group, raft_listener).await;
            }
        });
        let data_addr = serve(Arc::new(StatefulWorker::new(Arc::clone(&group)))).await;
        replicas.push(Replica {
            group,
            data_addr,
            raft_task,
        });
    }

    // Bootstrap first, then admit the others.
    replicas[0].group.join_or_bootstrap().await.unwrap();
    for replica in &replicas[1..] {
        replica.group.join_or_bootstrap().await.unwrap();
    }
    replicas
}

async fn read_count(pool: &ConnectionPool, addr: &str) -> i64 {
    let resp = pool
        .send(addr, &DataRequest::new("/count", DocBatch::empty()), None)
        .await
        .unwrap();
    let results = resp.results().unwrap();
    let count = results.values().find_map(|v| match v {
        Value::Map(map) => map.get("count").cloned(),
        _ => None,
    });
    match count {
        Some(Value::Int(n)) => n,
        other => panic!("unexpected count {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicated_writes_survive_leader_failure() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let replicas = start_cluster(&dirs).await;
    let pool = ConnectionPool::default();

    // Ten writes through a follower's data surface: they forward to the
    // leader, commit, and apply everywhere.
    for i in 0..10 {
        let req = DataRequest::new(
            "/index",
            DocBatch(vec![Document::with_id(format!("d{i}"))]),
        );
        let resp = pool.send(&replicas[1].data_addr, &req, None).await.unwrap();
        assert!(resp.first_failure().is_none(), "write {i} failed");
    }

    // Read-after-write through the leader is immediate.
    let leader_idx = replicas
        .iter()
        .position(|r| r.group.is_leader())
        .expect("a leader exists");
    assert_eq!(read_count(&pool, &replicas[leader_idx].data_addr).await, 10);

    // Followers converge on the applied count.
    let follower_idx = (leader_idx + 1) % replicas.len();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if read_count(&pool, &replicas[follower_idx].data_addr).await == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never caught up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Kill the leader; the survivors elect a new one.
    replicas[leader_idx].raft_task.abort();
    replicas[leader_idx].group.shutdown().await;

    let survivors: Vec<usize> = (0..replicas.len()).filter(|i| *i != leader_idx).collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let _new_leader = loop {
        let elected = survivors.iter().find(|i| replicas[**i].group.is_leader());
        if let Some(i) = elected {
            break *i;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no new leader elected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    // The count survives the failover.
    assert_eq!(read_count(&pool, &replicas[survivors[0]].data_addr).await, 10);
}
