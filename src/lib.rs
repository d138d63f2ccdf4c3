// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Quartzite: grouped-aggregation execution core for a pipelined columnar
//! query engine.
//!
//! The crate provides the hash-aggregation operator and everything it
//! stands on: the operator/factory traits of the pipeline layer, the
//! group-key hash table, accumulator-based aggregate functions, spill
//! storage with an asynchronous spill I/O pool, and the runtime ambient
//! pieces (memory tracking, profiles, per-query state). The pipeline
//! driver that schedules operators lives in the embedding engine; tests
//! stand in for it with a minimal push/pull/poll loop.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::app_config as quartzite_config;
pub use common::logging as quartzite_logging;
