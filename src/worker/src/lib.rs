// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The worker runtime.
//!
//! A [`WorkerRuntime`] hosts exactly one executor instance: it owns the
//! endpoint registry and the batching queues and implements the internal
//! `Data` surface (`Process`, `EndpointDiscovery`, `Health`). Heads embed
//! one for their wrapper executors; the launcher serves one per worker
//! replica.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use flow_executor::batch::BatchQueue;
use flow_executor::registry::EndpointRegistry;
use flow_executor::{Executor, HandlerOutput, RequestContext};
use flow_repr::request::DRY_RUN_ENDPOINT;
use flow_repr::schema::SchemaMap;
use flow_repr::{DataRequest, Error, ErrorStrategy, RouteStatus};
use flow_service::DataService;

/// Hosts one executor instance.
pub struct WorkerRuntime {
    name: String,
    executor: Arc<dyn Executor>,
    registry: EndpointRegistry,
    /// Lazily created queues for endpoints that declare batching, keyed by
    /// resolved endpoint name.
    queues: Mutex<HashMap<String, Arc<BatchQueue>>>,
}

impl WorkerRuntime {
    /// Builds the runtime for `executor`, reading its endpoint table once.
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> WorkerRuntime {
        let name = name.into();
        let registry = EndpointRegistry::new(&name, executor.as_ref());
        WorkerRuntime {
            name,
            executor,
            registry,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The node name this runtime reports in routes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hosted executor.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// The endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Invokes the endpoint handler on the request's batch and returns the
    /// transformed request.
    ///
    /// Handler failures are converted into a `Failed` route entry with the
    /// batch left intact, so chained reducers can still operate under the
    /// skip strategies. `Err` is reserved for cancellation.
    pub async fn process(&self, req: DataRequest) -> Result<DataRequest, Error> {
        self.process_inner(req, true).await
    }

    /// Like [`WorkerRuntime::process`] but bypassing dynamic batching.
    ///
    /// The consensus apply path uses this: committed log entries must map
    /// one-to-one onto handler invocations, in log order.
    pub async fn process_direct(&self, req: DataRequest) -> Result<DataRequest, Error> {
        self.process_inner(req, false).await
    }

    async fn process_inner(
        &self,
        mut req: DataRequest,
        allow_batching: bool,
    ) -> Result<DataRequest, Error> {
        let route = req.begin_route(&self.name);

        // A prior node failed: honor the flow's error strategy.
        if req.first_failure().is_some() {
            match req.headers.on_error {
                ErrorStrategy::SkipExecutor => {}
                ErrorStrategy::SkipHandle | ErrorStrategy::ThrowEarly => {
                    let chained = req
                        .first_failure()
                        .and_then(|r| r.error.clone())
                        .map(|e| e.chained(&self.name));
                    req.end_route(route, RouteStatus::Chained, chained);
                    return Ok(req);
                }
            }
        }

        let endpoint = req.effective_endpoint().to_string();
        if endpoint == DRY_RUN_ENDPOINT {
            req.end_route(route, RouteStatus::Succeeded, None);
            return Ok(req);
        }

        let (resolved, schema) = match self.registry.resolve(&endpoint) {
            Ok((name, schema)) => (name.to_string(), schema.clone()),
            Err(err) => {
                req.end_route(route, RouteStatus::Failed, Some(err));
                return Ok(req);
            }
        };

        let ctx = RequestContext {
            parameters: req.parameters_for(&self.name, &[]),
            headers: req.headers.clone(),
            endpoint: resolved.clone(),
        };

        debug!(
            node = %self.name,
            endpoint = %resolved,
            docs = req.docs.len(),
            "worker: processing request"
        );

        let outcome = match schema.batching.filter(|_| allow_batching) {
            Some(config) => {
                let queue = self.queue(&resolved, config);
                // The queue resolves the route itself by returning the
                // sliced request or the shared flush error.
                match queue.push(req.clone(), ctx).await {
                    Ok(mut sliced) => {
                        sliced.end_route(route, RouteStatus::Succeeded, None);
                        return Ok(sliced);
                    }
                    Err(err) if err.kind == flow_repr::ErrorKind::Cancelled => {
                        return Err(err);
                    }
                    Err(err) => Err(err),
                }
            }
            None => {
                let mut docs = std::mem::take(&mut req.docs);
                let result = self.executor.call(&resolved, &mut docs, &ctx).await;
                req.docs = docs;
                match result {
                    Ok(HandlerOutput::Keep) => Ok(()),
                    Ok(HandlerOutput::Docs(replacement)) => {
                        req.docs = replacement;
                        Ok(())
                    }
                    Ok(HandlerOutput::Params(map)) => {
                        req.record_result(&self.name, map);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match outcome {
            Ok(()) => req.end_route(route, RouteStatus::Succeeded, None),
            Err(err) => {
                let err = Error {
                    node: self.name.clone(),
                    ..err
                };
                req.end_route(route, RouteStatus::Failed, Some(err));
            }
        }
        Ok(req)
    }

    fn queue(&self, endpoint: &str, config: flow_repr::schema::BatchConfig) -> Arc<BatchQueue> {
        let mut queues = self.queues.lock();
        Arc::clone(queues.entry(endpoint.to_string()).or_insert_with(|| {
            Arc::new(BatchQueue::new(
                &self.name,
                endpoint,
                config,
                Arc::clone(&self.executor),
            ))
        }))
    }

    /// Shuts the runtime down: parked batch requests are released with
    /// `Cancelled` and the executor is closed.
    pub async fn close(&self) {
        for queue in self.queues.lock().values() {
            queue.close();
        }
        self.executor.close().await;
    }
}

#[async_trait]
impl DataService for WorkerRuntime {
    async fn process(&self, req: DataRequest) -> Result<DataRequest, Error> {
        WorkerRuntime::process(self, req).await
    }

    fn schema_map(&self) -> SchemaMap {
        self.registry.schema_map()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flow_executor::testing::{AppendExecutor, CounterExecutor, FailingExecutor, IdentityExecutor};
    use flow_executor::EndpointSpec;
    use flow_repr::schema::BatchConfig;
    use flow_repr::{DocBatch, Document, ErrorKind, Route, Value};

    use super::*;

    fn request(endpoint: &str, ids: &[&str]) -> DataRequest {
        DataRequest::new(
            endpoint,
            ids.iter().map(|id| Document::text(*id, "x")).collect(),
        )
    }

    #[tokio::test]
    async fn identity_preserves_batch() {
        let runtime = WorkerRuntime::new("id0", Arc::new(IdentityExecutor));
        let req = request("/anything", &["a", "b"]);
        let expected = req.docs.clone();
        let resp = runtime.process(req).await.unwrap();
        assert_eq!(resp.docs, expected);
        assert_eq!(resp.routes.last().unwrap().status, RouteStatus::Succeeded);
    }

    #[tokio::test]
    async fn unmapped_endpoint_without_default_fails_in_routes() {
        let runtime = WorkerRuntime::new("w0", Arc::new(AppendExecutor::new("/foo", "!")));
        let resp = runtime.process(request("/bar", &["a"])).await.unwrap();
        let failure = resp.first_failure().unwrap();
        assert_eq!(failure.error.as_ref().unwrap().kind, ErrorKind::NoSuchEndpoint);
        // The batch survives the failure.
        assert_eq!(resp.docs.ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_route_with_batch_intact() {
        let runtime = WorkerRuntime::new("w0", Arc::new(FailingExecutor::new("/foo", "boom")));
        let resp = runtime.process(request("/foo", &["a"])).await.unwrap();
        let failure = resp.first_failure().unwrap();
        assert_eq!(failure.node, "w0");
        assert_eq!(failure.error.as_ref().unwrap().node, "w0");
        assert_eq!(resp.docs.ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn skip_handle_chains_past_failed_upstream() {
        let runtime = WorkerRuntime::new("w1", Arc::new(AppendExecutor::new("/foo", "!")));
        let mut req = request("/foo", &["a"]);
        req.headers.on_error = flow_repr::ErrorStrategy::SkipHandle;
        req.routes.push(Route {
            node: "w0".into(),
            status: RouteStatus::Failed,
            error: Some(Error::internal("w0", "boom")),
        });
        let resp = runtime.process(req).await.unwrap();
        // Handler skipped: text unchanged.
        assert_eq!(resp.docs[0].text_content(), Some("x"));
        let own = resp.routes.iter().find(|r| r.node == "w1").unwrap();
        assert_eq!(own.status, RouteStatus::Chained);
    }

    #[tokio::test]
    async fn skip_executor_runs_handler_despite_failure() {
        let runtime = WorkerRuntime::new("w1", Arc::new(AppendExecutor::new("/foo", "!")));
        let mut req = request("/foo", &["a"]);
        req.headers.on_error = flow_repr::ErrorStrategy::SkipExecutor;
        req.routes.push(Route {
            node: "w0".into(),
            status: RouteStatus::Failed,
            error: Some(Error::internal("w0", "boom")),
        });
        let resp = runtime.process(req).await.unwrap();
        assert_eq!(resp.docs[0].text_content(), Some("x!"));
    }

    #[tokio::test]
    async fn params_output_lands_under_results_key() {
        let runtime = WorkerRuntime::new("counter0", Arc::new(CounterExecutor::new()));
        runtime.process(request("/index", &["a", "b"])).await.unwrap();
        let resp = runtime.process(request("/count", &[])).await.unwrap();
        let results = resp.results().unwrap();
        match results.get("counter0") {
            Some(Value::Map(map)) => assert_eq!(map.get("count"), Some(&Value::Int(2))),
            other => panic!("unexpected results entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_probe_succeeds_without_handler() {
        let runtime = WorkerRuntime::new("w0", Arc::new(FailingExecutor::new("/foo", "boom")));
        let resp = runtime
            .process(request(flow_repr::request::DRY_RUN_ENDPOINT, &[]))
            .await
            .unwrap();
        assert_eq!(resp.routes.last().unwrap().status, RouteStatus::Succeeded);
    }

    #[tokio::test]
    async fn batched_endpoint_slices_through_process() {
        struct BatchedAppend(AppendExecutor);

        #[async_trait]
        impl Executor for BatchedAppend {
            fn endpoints(&self) -> Vec<EndpointSpec> {
                vec![EndpointSpec::new("/foo").batched(BatchConfig {
                    preferred_batch_size: 2,
                    timeout: Duration::from_millis(50),
                })]
            }

            async fn call(
                &self,
                endpoint: &str,
                docs: &mut DocBatch,
                ctx: &RequestContext,
            ) -> Result<HandlerOutput, Error> {
                self.0.call(endpoint, docs, ctx).await
            }
        }

        let runtime = Arc::new(WorkerRuntime::new(
            "w0",
            Arc::new(BatchedAppend(AppendExecutor::new("/foo", "!"))),
        ));
        let resp = runtime.process(request("/foo", &["a"])).await.unwrap();
        assert_eq!(resp.docs.ids(), vec!["a"]);
        assert_eq!(resp.docs[0].text_content(), Some("x!"));
        assert_eq!(resp.routes.last().unwrap().status, RouteStatus::Succeeded);
    }

    #[test]
    fn schema_map_serves_discovery() {
        let runtime = WorkerRuntime::new("counter0", Arc::new(CounterExecutor::new()));
        let map = DataService::schema_map(&runtime);
        assert!(map.get("/index").unwrap().write_op);
        assert!(!map.get("/count").unwrap().write_op);
    }
}
