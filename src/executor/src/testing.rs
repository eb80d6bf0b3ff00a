// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Small executors used by tests and the demo plugins of the launcher.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use flow_repr::document::Content;
use flow_repr::request::DEFAULT_ENDPOINT;
use flow_repr::{DocBatch, Error, Value};

use crate::{EndpointSpec, Executor, ExecutorConfig, HandlerOutput, RequestContext};

/// Forwards every batch unchanged; registers only the default handler.
pub struct IdentityExecutor;

#[async_trait]
impl Executor for IdentityExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::new(DEFAULT_ENDPOINT)]
    }

    async fn call(
        &self,
        _endpoint: &str,
        _docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        Ok(HandlerOutput::Keep)
    }
}

/// Appends a suffix to every document's text content on one endpoint.
pub struct AppendExecutor {
    endpoint: String,
    suffix: String,
}

impl AppendExecutor {
    pub fn new(endpoint: impl Into<String>, suffix: impl Into<String>) -> AppendExecutor {
        AppendExecutor {
            endpoint: endpoint.into(),
            suffix: suffix.into(),
        }
    }

    /// Builds from an [`ExecutorConfig`], reading `endpoint` and `suffix`
    /// from `uses_with`.
    pub fn from_config(config: &ExecutorConfig) -> AppendExecutor {
        let get = |key: &str, default: &str| match config.with.get(key) {
            Some(Value::Str(s)) => s.clone(),
            _ => default.to_string(),
        };
        AppendExecutor::new(get("endpoint", DEFAULT_ENDPOINT), get("suffix", ""))
    }
}

#[async_trait]
impl Executor for AppendExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::new(&self.endpoint)]
    }

    async fn call(
        &self,
        _endpoint: &str,
        docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        for doc in docs.iter_mut() {
            let text = doc.text_content().unwrap_or("").to_string();
            doc.content = Content::Text(text + &self.suffix);
        }
        Ok(HandlerOutput::Keep)
    }
}

/// Fails every invocation with an internal error.
pub struct FailingExecutor {
    endpoint: String,
    message: String,
}

impl FailingExecutor {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> FailingExecutor {
        FailingExecutor {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Executor for FailingExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::new(&self.endpoint)]
    }

    async fn call(
        &self,
        _endpoint: &str,
        _docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        Err(Error::internal("failing-executor", self.message.clone()))
    }
}

/// Appends the configured shard id to `tags.seen` on every document.
pub struct TagShardExecutor {
    shard_id: i64,
}

impl TagShardExecutor {
    pub fn from_config(config: &ExecutorConfig) -> TagShardExecutor {
        let shard_id = match config.with.get("shard_id") {
            Some(Value::Int(i)) => *i,
            _ => 0,
        };
        TagShardExecutor { shard_id }
    }
}

#[async_trait]
impl Executor for TagShardExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::new(DEFAULT_ENDPOINT)]
    }

    async fn call(
        &self,
        _endpoint: &str,
        docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        for doc in docs.iter_mut() {
            let seen = doc
                .tags
                .entry("seen".to_string())
                .or_insert_with(|| Value::List(Vec::new()));
            if let Value::List(list) = seen {
                list.push(Value::Int(self.shard_id));
            }
        }
        Ok(HandlerOutput::Keep)
    }
}

/// Collapses duplicate document ids (as produced by an un-reduced fan-in)
/// into one document whose text is the concatenation of the copies' texts in
/// sorted order.
pub struct ConcatMergerExecutor;

#[async_trait]
impl Executor for ConcatMergerExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![EndpointSpec::new(DEFAULT_ENDPOINT)]
    }

    async fn call(
        &self,
        _endpoint: &str,
        docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        let mut order: Vec<String> = Vec::new();
        let mut texts: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for doc in docs.iter() {
            if !texts.contains_key(&doc.id) {
                order.push(doc.id.clone());
            }
            texts
                .entry(doc.id.clone())
                .or_default()
                .push(doc.text_content().unwrap_or("").to_string());
        }
        let merged = order
            .into_iter()
            .map(|id| {
                let mut parts = texts.remove(&id).unwrap_or_default();
                parts.sort();
                flow_repr::Document::text(id, parts.concat())
            })
            .collect();
        Ok(HandlerOutput::Docs(merged))
    }
}

/// A stateful counter: `/index` is a replicated write, `/count` a read.
/// Snapshots persist the count.
pub struct CounterExecutor {
    count: AtomicU64,
}

impl CounterExecutor {
    pub fn new() -> CounterExecutor {
        CounterExecutor {
            count: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CounterExecutor {
    fn default() -> Self {
        CounterExecutor::new()
    }
}

#[async_trait]
impl Executor for CounterExecutor {
    fn endpoints(&self) -> Vec<EndpointSpec> {
        vec![
            EndpointSpec::new("/index").write_op(),
            EndpointSpec::new("/count"),
        ]
    }

    async fn call(
        &self,
        endpoint: &str,
        docs: &mut DocBatch,
        _ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error> {
        match endpoint {
            "/index" => {
                self.count.fetch_add(docs.len() as u64, Ordering::SeqCst);
                Ok(HandlerOutput::Keep)
            }
            "/count" => {
                let mut params = BTreeMap::new();
                params.insert(
                    "count".to_string(),
                    Value::Int(self.count.load(Ordering::SeqCst) as i64),
                );
                Ok(HandlerOutput::Params(params))
            }
            other => Err(Error::internal(
                "counter",
                format!("unexpected endpoint {other}"),
            )),
        }
    }

    async fn snapshot(&self, path: &Path) -> Result<(), Error> {
        let count = self.count.load(Ordering::SeqCst);
        tokio::fs::write(path, count.to_string())
            .await
            .map_err(|e| Error::internal("counter", format!("snapshot: {e}")))
    }

    async fn restore(&self, path: &Path) -> Result<(), Error> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::internal("counter", format!("restore: {e}")))?;
        let count = raw
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::internal("counter", format!("restore: {e}")))?;
        self.count.store(count, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_snapshot_round_trip() {
        let dir = std::env::temp_dir().join(format!("counter-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("snap");

        let counter = CounterExecutor::new();
        counter.count.store(42, Ordering::SeqCst);
        counter.snapshot(&path).await.unwrap();

        let restored = CounterExecutor::new();
        restored.restore(&path).await.unwrap();
        assert_eq!(restored.count(), 42);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn concat_merger_sorts_branch_texts() {
        let merger = ConcatMergerExecutor;
        let mut docs: DocBatch = [("1", "B"), ("1", "A")]
            .iter()
            .map(|(id, t)| flow_repr::Document::text(*id, *t))
            .collect();
        let out = merger
            .call(DEFAULT_ENDPOINT, &mut docs, &Default::default())
            .await
            .unwrap();
        match out {
            HandlerOutput::Docs(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].text_content(), Some("AB"));
            }
            _ => panic!("expected replacement batch"),
        }
    }
}
