// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error kinds that cross component boundaries.

use serde::{Deserialize, Serialize};

/// The category of a runtime error.
///
/// Kinds are part of the wire contract: the gateway maps them onto protocol
/// status codes and the transport layer keys its retry decision on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The client-supplied request is malformed.
    InvalidInput,
    /// The routing target names no registered endpoint (and no default
    /// handler exists).
    NoSuchEndpoint,
    /// Declared schemas along a flow edge are incompatible. Start-up only.
    SchemaMismatch,
    /// The request was cancelled by deadline or client abort.
    Cancelled,
    /// A downstream node was unreachable after retries.
    Unavailable,
    /// A handler raised.
    Internal,
    /// The error was propagated from a prior node in the graph.
    Chained,
}

impl ErrorKind {
    /// Whether the transport layer may retry an operation failing with this
    /// kind. Handler-level errors are never retried by the core.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }
}

/// A runtime error, with the node that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} at {node}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Name of the node responsible for the failure.
    pub node: String,
    /// Remote stack trace, when the failure came from user code.
    pub stack: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, node: impl Into<String>, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            node: node.into(),
            stack: None,
        }
    }

    pub fn invalid_input(node: impl Into<String>, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidInput, node, message)
    }

    pub fn no_such_endpoint(node: impl Into<String>, endpoint: &str) -> Error {
        Error::new(
            ErrorKind::NoSuchEndpoint,
            node,
            format!("no handler bound to endpoint {endpoint} and no default handler exists"),
        )
    }

    pub fn unavailable(node: impl Into<String>, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Unavailable, node, message)
    }

    pub fn cancelled(node: impl Into<String>) -> Error {
        Error::new(ErrorKind::Cancelled, node, "request cancelled")
    }

    pub fn internal(node: impl Into<String>, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Internal, node, message)
    }

    /// Derives the `Chained` error recorded by nodes downstream of `self`.
    pub fn chained(&self, node: impl Into<String>) -> Error {
        Error {
            kind: ErrorKind::Chained,
            message: format!("upstream failure at {}: {}", self.node, self.message),
            node: node.into(),
            stack: None,
        }
    }
}
