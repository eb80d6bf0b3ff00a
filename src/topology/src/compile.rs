// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The topology compiler.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::TcpListener;

use tracing::debug;

use flow_repr::Predicate;

use crate::{
    CompiledFlow, DeploymentAddresses, DeploymentSpec, FlowSpec, NodeMeta, GATEWAY_END,
    GATEWAY_START,
};

/// Why a flow description failed to compile.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate deployment name {0}")]
    DuplicateDeployment(String),
    #[error("deployment {0} needs unknown deployment {1}")]
    UnknownNeeds(String, String),
    #[error("deployment {0} declares zero {1}")]
    ZeroScale(String, &'static str),
    #[error("floating deployment {0} cannot have dependents")]
    FloatingWithDependents(String),
    #[error("the flow graph contains a cycle through {0}")]
    Cycle(String),
    #[error("invalid when predicate on {0}: {1}")]
    BadPredicate(String, String),
    #[error("external deployment {0} requires host and port")]
    ExternalWithoutAddress(String),
    #[error("schema mismatch on edge {from} -> {to}, endpoint {endpoint}")]
    SchemaMismatch {
        from: String,
        to: String,
        endpoint: String,
    },
    #[error("failed to allocate a port on {0}: {1}")]
    PortAllocation(String, std::io::Error),
}

/// Compiles a flow description into the routable topology.
///
/// `default_host` is the bind host for deployments that do not name one.
pub fn compile(spec: &FlowSpec, default_host: &str) -> Result<CompiledFlow, CompileError> {
    let by_name: BTreeMap<&str, &DeploymentSpec> = {
        let mut map = BTreeMap::new();
        for dep in &spec.deployments {
            if map.insert(dep.name.as_str(), dep).is_some() {
                return Err(CompileError::DuplicateDeployment(dep.name.clone()));
            }
        }
        map
    };

    for dep in &spec.deployments {
        if dep.replicas == 0 {
            return Err(CompileError::ZeroScale(dep.name.clone(), "replicas"));
        }
        if dep.shards == 0 {
            return Err(CompileError::ZeroScale(dep.name.clone(), "shards"));
        }
        for need in &dep.needs {
            if !by_name.contains_key(need.as_str()) {
                return Err(CompileError::UnknownNeeds(dep.name.clone(), need.clone()));
            }
            if by_name[need.as_str()].floating {
                return Err(CompileError::FloatingWithDependents(need.clone()));
            }
        }
        if let Some(when) = &dep.when {
            Predicate::from_json(when)
                .map_err(|e| CompileError::BadPredicate(dep.name.clone(), e))?;
        }
        if dep.external && (dep.host.is_none() || dep.port.is_none()) {
            return Err(CompileError::ExternalWithoutAddress(dep.name.clone()));
        }
    }

    // Build the adjacency. Deployments with no needs hang off the gateway;
    // non-floating leaves feed end-gateway.
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    graph.insert(GATEWAY_START.to_string(), Vec::new());
    graph.insert(GATEWAY_END.to_string(), Vec::new());
    for dep in &spec.deployments {
        graph.entry(dep.name.clone()).or_default();
        if dep.needs.is_empty() {
            graph
                .get_mut(GATEWAY_START)
                .expect("inserted above")
                .push(dep.name.clone());
        } else {
            for need in &dep.needs {
                graph
                    .entry(need.clone())
                    .or_default()
                    .push(dep.name.clone());
            }
        }
    }
    for dep in &spec.deployments {
        let outgoing = graph.get_mut(&dep.name).expect("inserted above");
        if outgoing.is_empty() && !dep.floating {
            outgoing.push(GATEWAY_END.to_string());
        }
    }

    detect_cycle(&graph)?;
    check_schemas(spec, &by_name)?;

    // Allocate addresses. Explicit ports are honored; otherwise the OS
    // assigns one. A deployment gets a head when it fans out or wraps.
    let mut internal = BTreeMap::new();
    let mut addresses = BTreeMap::new();
    for dep in &spec.deployments {
        let host = dep.host.clone().unwrap_or_else(|| default_host.to_string());
        let wiring = if dep.external {
            DeploymentAddresses {
                head: None,
                shards: vec![vec![format!(
                    "{host}:{}",
                    dep.port.expect("validated above")
                )]],
            }
        } else {
            let needs_head = dep.shards > 1
                || dep.replicas > 1
                || dep.uses_before.is_some()
                || dep.uses_after.is_some();
            let mut next_port = dep.port;
            let mut allocate = |host: &str| -> Result<String, CompileError> {
                let port = match next_port.take() {
                    Some(explicit) => {
                        // Consecutive ports after an explicit base.
                        next_port = Some(explicit + 1);
                        explicit
                    }
                    None => os_assigned_port(host)?,
                };
                Ok(format!("{host}:{port}"))
            };
            let head = if needs_head {
                Some(allocate(&host)?)
            } else {
                None
            };
            let mut shards = Vec::with_capacity(dep.shards);
            for _shard in 0..dep.shards {
                let mut replicas = Vec::with_capacity(dep.replicas);
                for _replica in 0..dep.replicas {
                    replicas.push(allocate(&host)?);
                }
                shards.push(replicas);
            }
            DeploymentAddresses { head, shards }
        };
        addresses.insert(dep.name.clone(), wiring.ingress());
        internal.insert(dep.name.clone(), wiring);
    }

    let mut metadata: BTreeMap<String, NodeMeta> = BTreeMap::new();
    for dep in &spec.deployments {
        metadata.insert(
            dep.name.clone(),
            NodeMeta {
                floating: dep.floating,
                when: dep.when.clone(),
                disable_reduce: dep.disable_reduce,
                number_of_parts: 0,
            },
        );
    }
    for downstreams in graph.values() {
        for downstream in downstreams {
            if let Some(meta) = metadata.get_mut(downstream) {
                meta.number_of_parts += 1;
            }
        }
    }

    debug!(
        nodes = spec.deployments.len(),
        "topology: compiled flow graph"
    );
    Ok(CompiledFlow {
        graph,
        addresses,
        metadata,
        internal,
    })
}

/// Kahn's algorithm; any leftover node sits on a cycle.
fn detect_cycle(graph: &BTreeMap<String, Vec<String>>) -> Result<(), CompileError> {
    let mut in_degree: BTreeMap<&str, usize> =
        graph.keys().map(|n| (n.as_str(), 0)).collect();
    for downstreams in graph.values() {
        for downstream in downstreams {
            *in_degree.entry(downstream.as_str()).or_default() += 1;
        }
    }
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = BTreeSet::new();
    while let Some(node) = queue.pop_front() {
        visited.insert(node);
        if let Some(downstreams) = graph.get(node) {
            for downstream in downstreams {
                let d = in_degree.get_mut(downstream.as_str()).expect("all known");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(downstream.as_str());
                }
            }
        }
    }
    match graph.keys().find(|n| !visited.contains(n.as_str())) {
        Some(node) => Err(CompileError::Cycle(node.clone())),
        None => Ok(()),
    }
}

/// Checks every edge `A -> B`: for each endpoint declared on both sides,
/// B's request schema must accept A's response schema.
fn check_schemas(
    spec: &FlowSpec,
    by_name: &BTreeMap<&str, &DeploymentSpec>,
) -> Result<(), CompileError> {
    for dep in &spec.deployments {
        for need in &dep.needs {
            let upstream = by_name[need.as_str()];
            for (endpoint, consumer) in &dep.schemas {
                let Some(producer) = upstream.schemas.get(endpoint) else {
                    continue;
                };
                if !consumer.request.accepts(&producer.response) {
                    return Err(CompileError::SchemaMismatch {
                        from: upstream.name.clone(),
                        to: dep.name.clone(),
                        endpoint: endpoint.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn os_assigned_port(host: &str) -> Result<u16, CompileError> {
    let listener = TcpListener::bind((host, 0))
        .map_err(|e| CompileError::PortAllocation(host.to_string(), e))?;
    let port = listener
        .local_addr()
        .map_err(|e| CompileError::PortAllocation(host.to_string(), e))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use flow_repr::schema::{EndpointSchema, FieldType, RecordSchema};

    use super::*;

    fn dep(name: &str, needs: &[&str]) -> DeploymentSpec {
        DeploymentSpec {
            name: name.into(),
            uses: "identity".into(),
            uses_with: Default::default(),
            uses_metas: None,
            replicas: 1,
            shards: 1,
            polling: Default::default(),
            uses_before: None,
            uses_after: None,
            needs: needs.iter().map(|s| s.to_string()).collect(),
            when: None,
            floating: false,
            external: false,
            host: None,
            port: None,
            disable_reduce: false,
            stateful: false,
            schemas: Default::default(),
        }
    }

    fn flow(deployments: Vec<DeploymentSpec>) -> FlowSpec {
        FlowSpec {
            deployments,
            ..Default::default()
        }
    }

    #[test]
    fn linear_chain_wires_gateway_synthetics() {
        let compiled =
            compile(&flow(vec![dep("enc", &[]), dep("dec", &["enc"])]), "127.0.0.1").unwrap();
        assert_eq!(compiled.graph[GATEWAY_START], vec!["enc"]);
        assert_eq!(compiled.graph["enc"], vec!["dec"]);
        assert_eq!(compiled.graph["dec"], vec![GATEWAY_END]);
        // Every node appears in the address map with at least one endpoint.
        assert!(!compiled.addresses["enc"].is_empty());
        assert!(!compiled.addresses["dec"].is_empty());
    }

    #[test]
    fn bifurcation_counts_parts() {
        let compiled = compile(
            &flow(vec![
                dep("a", &[]),
                dep("b", &[]),
                dep("merger", &["a", "b"]),
            ]),
            "127.0.0.1",
        )
        .unwrap();
        assert_eq!(compiled.metadata["merger"].number_of_parts, 2);
        assert_eq!(compiled.metadata["a"].number_of_parts, 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut a = dep("a", &["b"]);
        let b = dep("b", &["a"]);
        a.needs = vec!["b".into()];
        let err = compile(&flow(vec![a, b]), "127.0.0.1").unwrap_err();
        assert!(matches!(err, CompileError::Cycle(_)));
    }

    #[test]
    fn unknown_needs_rejected() {
        let err = compile(&flow(vec![dep("a", &["ghost"])]), "127.0.0.1").unwrap_err();
        assert!(matches!(err, CompileError::UnknownNeeds(_, _)));
    }

    #[test]
    fn floating_leaf_has_no_end_gateway_edge() {
        let mut logger = dep("logger", &[]);
        logger.floating = true;
        let compiled = compile(&flow(vec![dep("main", &[]), logger]), "127.0.0.1").unwrap();
        assert!(compiled.graph["logger"].is_empty());
        assert!(compiled.metadata["logger"].floating);
        assert_eq!(compiled.graph["main"], vec![GATEWAY_END]);
    }

    #[test]
    fn floating_with_dependents_rejected() {
        let mut logger = dep("logger", &[]);
        logger.floating = true;
        let err = compile(
            &flow(vec![logger, dep("after", &["logger"])]),
            "127.0.0.1",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::FloatingWithDependents(_)));
    }

    #[test]
    fn sharded_deployment_gets_a_head() {
        let mut sharded = dep("sharded", &[]);
        sharded.shards = 2;
        sharded.replicas = 2;
        let compiled = compile(&flow(vec![sharded]), "127.0.0.1").unwrap();
        let wiring = &compiled.internal["sharded"];
        assert!(wiring.head.is_some());
        assert_eq!(wiring.shards.len(), 2);
        assert_eq!(wiring.shards[0].len(), 2);
        // The gateway only sees the head.
        assert_eq!(compiled.addresses["sharded"], wiring.ingress());
        assert_eq!(compiled.addresses["sharded"].len(), 1);
    }

    #[test]
    fn explicit_ports_are_consecutive() {
        let mut d = dep("fixed", &[]);
        d.port = Some(14500);
        d.replicas = 2;
        let compiled = compile(&flow(vec![d]), "127.0.0.1").unwrap();
        let wiring = &compiled.internal["fixed"];
        assert!(wiring.head.is_some());
        assert_eq!(wiring.head.as_deref(), Some("127.0.0.1:14500"));
        assert_eq!(wiring.shards[0], vec!["127.0.0.1:14501", "127.0.0.1:14502"]);
    }

    #[test]
    fn external_deployment_keeps_its_address() {
        let mut ext = dep("ext", &[]);
        ext.external = true;
        ext.host = Some("10.1.2.3".into());
        ext.port = Some(8080);
        let compiled = compile(&flow(vec![ext]), "127.0.0.1").unwrap();
        assert_eq!(compiled.addresses["ext"], vec!["10.1.2.3:8080"]);
        assert!(compiled.internal["ext"].head.is_none());
    }

    #[test]
    fn schema_mismatch_fails_compilation() {
        let mut producer = dep("producer", &[]);
        producer.schemas.insert(
            "/foo".into(),
            EndpointSchema {
                response: RecordSchema {
                    fields: [("other".to_string(), FieldType::Int)].into(),
                    required: Default::default(),
                },
                ..Default::default()
            },
        );
        let mut consumer = dep("consumer", &["producer"]);
        consumer.schemas.insert(
            "/foo".into(),
            EndpointSchema {
                request: RecordSchema {
                    fields: [("text".to_string(), FieldType::Str)].into(),
                    required: ["text".to_string()].into(),
                },
                ..Default::default()
            },
        );
        let err = compile(&flow(vec![producer, consumer]), "127.0.0.1").unwrap_err();
        assert!(matches!(err, CompileError::SchemaMismatch { .. }));
    }

    #[test]
    fn bad_predicate_rejected() {
        let mut d = dep("a", &[]);
        d.when = Some(serde_json::json!({"tags.type": {"$bogus": 1}}));
        let err = compile(&flow(vec![d]), "127.0.0.1").unwrap_err();
        assert!(matches!(err, CompileError::BadPredicate(_, _)));
    }
}
