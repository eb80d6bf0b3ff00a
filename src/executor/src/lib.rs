// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! User compute units and the machinery that hosts them.
//!
//! An [`Executor`] declares its endpoints as an explicit table and is
//! dispatched through [`Executor::call`]. The [`registry`] resolves endpoint
//! names (with default-handler fallback), the [`batch`] module coalesces
//! requests for endpoints that declare dynamic batching, and the [`plugin`]
//! registry maps executor names to factories at flow construction time.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use flow_repr::schema::EndpointSchema;
use flow_repr::{DocBatch, Error, Headers, Value};

pub mod batch;
pub mod plugin;
pub mod registry;
pub mod testing;

/// Construction-time configuration handed to an executor factory.
#[derive(Clone, Debug, Default)]
pub struct ExecutorConfig {
    /// The executor's instance name; defaults to the deployment name and may
    /// be overridden via `uses_metas`.
    pub name: String,
    /// The free-form `uses_with` parameter map.
    pub with: BTreeMap<String, Value>,
    /// Directory for executor-owned state (snapshots land here for stateful
    /// deployments).
    pub workspace: Option<std::path::PathBuf>,
}

/// The explicit per-request context passed to every handler, replacing
/// ad-hoc keyword injection.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Parameters visible to this executor (executor-specific sub-map
    /// already merged).
    pub parameters: BTreeMap<String, Value>,
    /// The request headers.
    pub headers: Headers,
    /// The endpoint being invoked.
    pub endpoint: String,
}

/// One row of an executor's endpoint table.
#[derive(Clone, Debug)]
pub struct EndpointSpec {
    /// The endpoint name, e.g. `/search`, or
    /// [`DEFAULT_ENDPOINT`](flow_repr::request::DEFAULT_ENDPOINT) for the
    /// fallback handler.
    pub name: String,
    pub schema: EndpointSchema,
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>) -> EndpointSpec {
        EndpointSpec {
            name: name.into(),
            schema: EndpointSchema::default(),
        }
    }

    pub fn with_schema(mut self, schema: EndpointSchema) -> EndpointSpec {
        self.schema = schema;
        self
    }

    /// Marks invocations of this endpoint as state-mutating.
    pub fn write_op(mut self) -> EndpointSpec {
        self.schema.write_op = true;
        self
    }

    /// Declares dynamic batching for this endpoint.
    pub fn batched(mut self, config: flow_repr::schema::BatchConfig) -> EndpointSpec {
        self.schema.batching = Some(config);
        self
    }
}

/// What a handler did with the batch.
#[derive(Debug)]
pub enum HandlerOutput {
    /// Keep the (possibly mutated in place) input batch.
    Keep,
    /// Replace the input batch with a new one.
    Docs(DocBatch),
    /// Keep the batch and merge this map into the response parameters under
    /// the results key.
    Params(BTreeMap<String, Value>),
}

/// A user compute unit.
///
/// Implementations register their endpoints via [`Executor::endpoints`] once
/// at construction; dispatch goes through [`Executor::call`] with the
/// resolved endpoint name (after default-handler fallback).
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The endpoint table. Read once when the hosting runtime is built.
    fn endpoints(&self) -> Vec<EndpointSpec>;

    /// Invokes the handler bound to `endpoint` on `docs`.
    ///
    /// Handlers may mutate `docs` in place and return
    /// [`HandlerOutput::Keep`], return a replacement batch, or return a
    /// parameter map. Errors become tagged `Internal` responses at the
    /// worker boundary.
    async fn call(
        &self,
        endpoint: &str,
        docs: &mut DocBatch,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput, Error>;

    /// Writes a snapshot of executor state to `path`.
    ///
    /// Only invoked for stateful deployments; the blob format is the
    /// executor's concern.
    async fn snapshot(&self, path: &Path) -> Result<(), Error> {
        let _ = path;
        Ok(())
    }

    /// Restores executor state from a snapshot previously written by
    /// [`Executor::snapshot`].
    async fn restore(&self, path: &Path) -> Result<(), Error> {
        let _ = path;
        Ok(())
    }

    /// Releases executor resources at shutdown.
    async fn close(&self) {}
}
