// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Gateway-level prometheus metrics.

use prometheus::{IntCounter, Registry};

use flow_repr::{DataRequest, Error};

/// Counters shared by every protocol surface of the gateway.
#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    pub requests_total: IntCounter,
    pub failures_total: IntCounter,
}

impl GatewayMetrics {
    /// Registers the gateway metrics in `registry`.
    pub fn register(registry: &Registry) -> GatewayMetrics {
        let requests_total = IntCounter::new(
            "flow_gateway_requests_total",
            "Requests completed by the gateway, any protocol.",
        )
        .expect("valid metric");
        let failures_total = IntCounter::new(
            "flow_gateway_failures_total",
            "Requests that completed with a failure in their routes.",
        )
        .expect("valid metric");
        // Double registration only happens with duplicate gateways in one
        // process; ignore it rather than crash the second one.
        let _ = registry.register(Box::new(requests_total.clone()));
        let _ = registry.register(Box::new(failures_total.clone()));
        GatewayMetrics {
            requests_total,
            failures_total,
        }
    }

    /// Unregistered counters, for tests and embedded use.
    pub fn detached() -> GatewayMetrics {
        GatewayMetrics::register(&Registry::new())
    }

    /// Records one completed request.
    pub fn observe(&self, result: &Result<DataRequest, Error>) {
        self.requests_total.inc();
        match result {
            Ok(resp) if resp.first_failure().is_none() => {}
            _ => self.failures_total.inc(),
        }
    }
}
