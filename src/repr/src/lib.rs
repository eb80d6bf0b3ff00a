// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The core data model for flowd.
//!
//! This crate defines the types that travel between components: [`Document`]s
//! and their batches, [`DataRequest`]s with headers, parameters and the
//! routes table, the recursive [`Value`] tag tree with its filter predicate
//! language, endpoint [`schema`]s, and the binary [`wire`] encoding. It has
//! no networking or async dependencies; everything here is plain data.
//!
//! [`Document`]: crate::document::Document
//! [`DataRequest`]: crate::request::DataRequest
//! [`Value`]: crate::value::Value

pub mod document;
pub mod error;
pub mod reduce;
pub mod request;
pub mod schema;
pub mod value;
pub mod wire;

pub use document::{Content, DocBatch, Document};
pub use error::{Error, ErrorKind};
pub use request::{DataRequest, ErrorStrategy, Headers, RequestId, Route, RouteStatus};
pub use value::{Predicate, Value};
