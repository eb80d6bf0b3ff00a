// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The dynamic batching queue.
//!
//! One queue per (executor, endpoint) that declares batching. Arriving
//! requests park on a completion signal while their documents accumulate
//! into a pending big-batch; a single flusher invokes the handler exactly
//! once per flush and slices the result back along the original request
//! boundaries. Only one flush is in progress at a time; arrivals during a
//! flush accumulate into the next batch.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use flow_ore::task::{AbortOnDropHandle, JoinHandleExt};
use flow_repr::schema::BatchConfig;
use flow_repr::{DataRequest, DocBatch, Error};

use crate::{Executor, HandlerOutput, RequestContext};

/// A parked request awaiting its slice of a flushed batch.
struct Parked {
    req: DataRequest,
    ctx: RequestContext,
    reply: oneshot::Sender<Result<DataRequest, Error>>,
}

/// A batching queue for one endpoint of one executor.
///
/// Closing (or dropping) the queue aborts the flusher; requests parked at
/// that point are released with `Cancelled`.
pub struct BatchQueue {
    node: String,
    tx: mpsc::UnboundedSender<Parked>,
    flusher: parking_lot::Mutex<Option<AbortOnDropHandle<()>>>,
}

impl BatchQueue {
    /// Spawns the flusher for `endpoint` with the given config.
    pub fn new(
        node: impl Into<String>,
        endpoint: impl Into<String>,
        config: BatchConfig,
        executor: Arc<dyn Executor>,
    ) -> BatchQueue {
        let node = node.into();
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = flow_ore::task::spawn(
            || format!("batch-queue:{node}:{endpoint}"),
            run_flusher(node.clone(), endpoint.clone(), config, executor, rx),
        )
        .abort_on_drop();
        BatchQueue {
            node,
            tx,
            flusher: parking_lot::Mutex::new(Some(flusher)),
        }
    }

    /// Stops the flusher. Requests parked at this point are released with
    /// `Cancelled`; subsequent pushes fail the same way.
    pub fn close(&self) {
        self.flusher.lock().take();
    }

    /// Parks `req` until its batch flushes, then returns the request with
    /// its slice of the result.
    ///
    /// Completion takes at most `timeout + handler_duration` under normal
    /// conditions. Document order within the request is preserved.
    pub async fn push(
        &self,
        req: DataRequest,
        ctx: RequestContext,
    ) -> Result<DataRequest, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Parked { req, ctx, reply })
            .map_err(|_| Error::cancelled(&self.node))?;
        match rx.await {
            Ok(result) => result,
            // Flusher dropped mid-flight: the queue is shutting down.
            Err(_) => Err(Error::cancelled(&self.node)),
        }
    }
}

async fn run_flusher(
    node: String,
    endpoint: String,
    config: BatchConfig,
    executor: Arc<dyn Executor>,
    mut rx: mpsc::UnboundedReceiver<Parked>,
) {
    loop {
        // Wait for the first request of the next batch; it starts the clock.
        let Some(first) = rx.recv().await else {
            return;
        };
        let deadline = Instant::now() + config.timeout;
        let mut parked = vec![first];
        let mut pending_docs = parked[0].req.docs.len();

        while pending_docs < config.preferred_batch_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(next)) => {
                    pending_docs += next.req.docs.len();
                    parked.push(next);
                }
                // Sender gone; flush what we have and exit.
                Ok(None) => {
                    flush(&node, &endpoint, &executor, parked).await;
                    return;
                }
                // Timeout elapsed since the first parked request.
                Err(_) => break,
            }
        }

        debug!(
            node = %node,
            endpoint = %endpoint,
            requests = parked.len(),
            docs = pending_docs,
            "batch queue: flushing"
        );
        flush(&node, &endpoint, &executor, parked).await;
    }
}

/// Invokes the handler once on the accumulated batch and releases every
/// parked request with its slice, or with the shared error.
async fn flush(node: &str, endpoint: &str, executor: &Arc<dyn Executor>, parked: Vec<Parked>) {
    let mut big_batch = DocBatch::empty();
    let mut lens = Vec::with_capacity(parked.len());
    for p in &parked {
        lens.push(p.req.docs.len());
        big_batch.extend(p.req.docs.clone());
    }

    // Handlers see the first request's context; batches are homogeneous per
    // endpoint and per-request parameter divergence is not supported across
    // a flush.
    let ctx = parked[0].ctx.clone();
    let total: usize = lens.iter().sum();

    let outcome = executor.call(endpoint, &mut big_batch, &ctx).await;
    let (mut result, params) = match outcome {
        Ok(HandlerOutput::Keep) => (big_batch, None),
        Ok(HandlerOutput::Docs(docs)) => (docs, None),
        Ok(HandlerOutput::Params(map)) => (big_batch, Some(map)),
        Err(err) => {
            for p in parked {
                let _ = p.reply.send(Err(err.clone()));
            }
            return;
        }
    };

    if result.len() != total {
        let err = Error::internal(
            node,
            format!(
                "batched handler for {endpoint} returned {} documents for a batch of {total}; \
                 slice boundaries would not match",
                result.len()
            ),
        );
        for p in parked {
            let _ = p.reply.send(Err(err.clone()));
        }
        return;
    }

    for (p, len) in parked.into_iter().zip(lens) {
        let mut req = p.req;
        req.docs = result.split_off_front(len);
        if let Some(map) = &params {
            req.record_result(node, map.clone());
        }
        let _ = p.reply.send(Ok(req));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use flow_repr::Document;

    use crate::testing::{AppendExecutor, FailingExecutor};

    use super::*;

    fn config(size: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            preferred_batch_size: size,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn request(ids: &[&str]) -> DataRequest {
        DataRequest::new(
            "/foo",
            ids.iter().map(|id| Document::text(*id, "d")).collect(),
        )
    }

    /// A counting executor that records how many times it was invoked.
    struct CountingAppend {
        inner: AppendExecutor,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Executor for CountingAppend {
        fn endpoints(&self) -> Vec<crate::EndpointSpec> {
            self.inner.endpoints()
        }

        async fn call(
            &self,
            endpoint: &str,
            docs: &mut DocBatch,
            ctx: &RequestContext,
        ) -> Result<HandlerOutput, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.call(endpoint, docs, ctx).await
        }
    }

    #[tokio::test]
    async fn size_trigger_flushes_once_with_correct_slices() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingAppend {
            inner: AppendExecutor::new("/foo", "!"),
            calls: Arc::clone(&calls),
        });
        let queue = Arc::new(BatchQueue::new("w", "/foo", config(4, 10_000), executor));

        let a = flow_ore::task::spawn(|| "push-a", {
            let queue = Arc::clone(&queue);
            async move { queue.push(request(&["a1", "a2"]), Default::default()).await }
        });
        let b = flow_ore::task::spawn(|| "push-b", {
            let queue = Arc::clone(&queue);
            async move { queue.push(request(&["b1", "b2"]), Default::default()).await }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.docs.ids(), vec!["a1", "a2"]);
        assert_eq!(b.docs.ids(), vec!["b1", "b2"]);
        assert_eq!(a.docs[0].text_content(), Some("d!"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_trigger_flushes_partial_batch() {
        let executor = Arc::new(AppendExecutor::new("/foo", "!"));
        let queue = BatchQueue::new("w", "/foo", config(100, 50), executor);
        let resp = queue
            .push(request(&["only"]), Default::default())
            .await
            .unwrap();
        assert_eq!(resp.docs.ids(), vec!["only"]);
    }

    #[tokio::test]
    async fn handler_error_reaches_every_parked_request() {
        let executor = Arc::new(FailingExecutor::new("/foo", "kaboom"));
        let queue = Arc::new(BatchQueue::new("w", "/foo", config(2, 10_000), executor));
        let a = flow_ore::task::spawn(|| "push-a", {
            let queue = Arc::clone(&queue);
            async move { queue.push(request(&["a"]), Default::default()).await }
        });
        let b = flow_ore::task::spawn(|| "push-b", {
            let queue = Arc::clone(&queue);
            async move { queue.push(request(&["b"]), Default::default()).await }
        });
        let err_a = a.await.unwrap().unwrap_err();
        let err_b = b.await.unwrap().unwrap_err();
        assert!(err_a.message.contains("kaboom"));
        assert_eq!(err_a, err_b);
    }

    #[tokio::test]
    async fn closing_queue_cancels_parked_requests() {
        let executor = Arc::new(AppendExecutor::new("/foo", "!"));
        let queue = Arc::new(BatchQueue::new("w", "/foo", config(100, 60_000), executor));
        let pending = flow_ore::task::spawn(|| "push", {
            let queue = Arc::clone(&queue);
            async move { queue.push(request(&["a"]), Default::default()).await }
        });
        // Let the push park, then tear the queue down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, flow_repr::ErrorKind::Cancelled);
    }
}
