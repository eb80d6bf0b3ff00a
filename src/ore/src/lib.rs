// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility library for flowd.
//!
//! The contents of this crate are not specific to serving flows; they are the
//! small pieces of task and retry machinery that every other crate in the
//! workspace leans on. Nothing in here may depend on another `flow-*` crate.

pub mod retry;
pub mod task;
