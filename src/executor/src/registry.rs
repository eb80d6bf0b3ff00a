// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-executor endpoint registry.
//!
//! Built once from the executor's declared endpoint table and immutable
//! afterwards. Resolution falls back to the default handler; the synthetic
//! dry-run probe exists on every executor.

use std::collections::BTreeMap;

use flow_repr::request::{DEFAULT_ENDPOINT, DRY_RUN_ENDPOINT};
use flow_repr::schema::{EndpointSchema, SchemaMap};
use flow_repr::Error;

use crate::{EndpointSpec, Executor};

/// Maps endpoint names to their declared schemas for one executor instance.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    executor_name: String,
    endpoints: BTreeMap<String, EndpointSchema>,
}

impl EndpointRegistry {
    /// Builds the registry from an executor's endpoint table, adding the
    /// synthetic dry-run probe.
    pub fn new(executor_name: impl Into<String>, executor: &dyn Executor) -> EndpointRegistry {
        let mut endpoints: BTreeMap<String, EndpointSchema> = executor
            .endpoints()
            .into_iter()
            .map(|EndpointSpec { name, schema }| (name, schema))
            .collect();
        endpoints
            .entry(DRY_RUN_ENDPOINT.to_string())
            .or_insert_with(EndpointSchema::default);
        EndpointRegistry {
            executor_name: executor_name.into(),
            endpoints,
        }
    }

    /// Resolves an endpoint name to the endpoint that will actually serve
    /// it, falling back to the default handler.
    ///
    /// Fails with `NoSuchEndpoint` only when the name is unmapped and no
    /// default handler exists.
    pub fn resolve(&self, endpoint: &str) -> Result<(&str, &EndpointSchema), Error> {
        if let Some((name, schema)) = self.endpoints.get_key_value(endpoint) {
            return Ok((name, schema));
        }
        if let Some((name, schema)) = self.endpoints.get_key_value(DEFAULT_ENDPOINT) {
            return Ok((name, schema));
        }
        Err(Error::no_such_endpoint(&self.executor_name, endpoint))
    }

    /// Whether requests for `endpoint` would be served (directly or through
    /// the default handler). The gateway uses the discovery form of this to
    /// gate sends.
    pub fn serves(&self, endpoint: &str) -> bool {
        self.endpoints.contains_key(endpoint) || self.endpoints.contains_key(DEFAULT_ENDPOINT)
    }

    /// The schema map exposed through the discovery RPC.
    pub fn schema_map(&self) -> SchemaMap {
        self.endpoints.clone()
    }

    /// The instance name of the owning executor.
    pub fn executor_name(&self) -> &str {
        &self.executor_name
    }
}

#[cfg(test)]
mod tests {
    use flow_repr::ErrorKind;

    use crate::testing::{AppendExecutor, IdentityExecutor};

    use super::*;

    #[test]
    fn resolves_declared_endpoint() {
        let exec = AppendExecutor::new("/foo", " x");
        let registry = EndpointRegistry::new("append", &exec);
        let (name, _) = registry.resolve("/foo").unwrap();
        assert_eq!(name, "/foo");
    }

    #[test]
    fn falls_back_to_default() {
        // The identity executor registers only the default handler.
        let exec = IdentityExecutor;
        let registry = EndpointRegistry::new("identity", &exec);
        let (name, _) = registry.resolve("/anything").unwrap();
        assert_eq!(name, DEFAULT_ENDPOINT);
        assert!(registry.serves("/whatever"));
    }

    #[test]
    fn unmapped_without_default_fails() {
        let exec = AppendExecutor::new("/foo", " x");
        let registry = EndpointRegistry::new("append", &exec);
        let err = registry.resolve("/bar").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSuchEndpoint);
        assert!(!registry.serves("/bar"));
    }

    #[test]
    fn dry_run_always_present() {
        let exec = AppendExecutor::new("/foo", " x");
        let registry = EndpointRegistry::new("append", &exec);
        assert!(registry.schema_map().contains_key(DRY_RUN_ENDPOINT));
    }
}
