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
//! Aggregation builder contract shared by the in-memory and spillable
//! strategies.

use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;

/// Accumulation strategy behind the hash aggregation operator. The operator
/// pushes every input page through `process_page` followed by
/// `update_memory`, and calls `build_result` exactly once per builder, after
/// which the builder only has to support `close`.
pub trait HashAggregationBuilder: Send {
    /// Absorb one input page. The page is either fully absorbed or the call
    /// fails; there is no partial accumulation.
    fn process_page(&mut self, page: Page) -> Result<(), String>;

    /// Settle memory accounting after a page was absorbed. Partial-output
    /// builders flip to full at their soft cap; final-output builders either
    /// enforce the tracker limit or start a spill here.
    fn update_memory(&mut self) -> Result<(), String>;

    /// Whether the operator must drain this builder before pushing more
    /// input. Spillable builders never report full; they shed memory to disk
    /// instead.
    fn is_full(&self) -> bool;

    /// Dependency the driver must wait on before the next push or
    /// `build_result` can make progress, if any.
    fn blocked_dependency(&self) -> Option<DependencyHandle>;

    /// Turn the accumulated state into a result stream. The stream takes
    /// ownership of the state; the builder is drained afterwards.
    fn build_result(&mut self) -> Result<Box<dyn AggregatedPageStream>, String>;

    /// Release resources not yet handed to a result stream. Idempotent.
    fn close(&mut self);
}

/// One-shot stream of aggregated output pages.
pub trait AggregatedPageStream: Send {
    /// Next output page, `Ok(None)` once drained.
    fn next_page(&mut self) -> Result<Option<Page>, String>;

    /// Whether the stream can produce no further page. Valid immediately
    /// after construction, so a caller can discard an empty stream without
    /// pulling from it.
    fn is_exhausted(&self) -> bool;
}
