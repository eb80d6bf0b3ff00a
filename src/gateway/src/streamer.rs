// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Streaming request execution with back-pressure.
//!
//! One client call is a lazy, single-pass, cancellable sequence of requests.
//! The streamer pulls from it only while fewer than `prefetch` requests are
//! in flight (zero means uncapped) and emits responses either strictly FIFO
//! (`results_in_order`) or as they complete. Dropping the output stream
//! cancels every in-flight downstream call.

use std::sync::Arc;

use futures::stream::{Stream, StreamExt};

use flow_repr::{DataRequest, Error};

use crate::graph::GraphDriver;

/// Streams requests through a graph driver.
#[derive(Clone)]
pub struct RequestStreamer {
    driver: Arc<GraphDriver>,
    prefetch: usize,
    results_in_order: bool,
}

impl RequestStreamer {
    pub fn new(driver: Arc<GraphDriver>, prefetch: usize, results_in_order: bool) -> Self {
        RequestStreamer {
            driver,
            prefetch,
            results_in_order,
        }
    }

    /// The driver backing this streamer.
    pub fn driver(&self) -> &Arc<GraphDriver> {
        &self.driver
    }

    /// Executes a single request. The HTTP surface uses this.
    pub async fn execute(&self, req: DataRequest) -> Result<DataRequest, Error> {
        self.driver.execute(req).await
    }

    /// Turns a stream of requests into a stream of responses, applying the
    /// prefetch cap and the ordering policy.
    pub fn stream<S>(
        &self,
        requests: S,
    ) -> impl Stream<Item = Result<DataRequest, Error>> + Send + 'static
    where
        S: Stream<Item = DataRequest> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let in_flight = match self.prefetch {
            0 => usize::MAX,
            n => n,
        };
        let executions = requests.map(move |req| {
            let driver = Arc::clone(&driver);
            async move { driver.execute(req).await }
        });
        if self.results_in_order {
            executions.buffered(in_flight).boxed()
        } else {
            executions.buffer_unordered(in_flight).boxed()
        }
    }
}
