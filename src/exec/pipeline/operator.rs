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
//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines the processor execution contract drivers use to push input pages
//!   and pull output pages cooperatively.
//! - Blocking is surfaced as a dependency handle; a driver parks the operator
//!   until the dependency signals ready instead of spinning on it.
//!
//! Key exported interfaces:
//! - Types: `Operator`, `ProcessorOperator`.
//!
//! Current limitations:
//! - Unsupported states should be surfaced as explicit runtime errors instead
//!   of fallback behavior.

use std::sync::Arc;

use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::OperatorProfiles;
use crate::runtime::runtime_state::RuntimeState;

/// Base operator contract implemented by source/processor/sink operator
/// implementations.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        let _ = tracker;
    }

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        let _ = profiles;
    }

    fn prepare(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Extended operator contract for processor stages with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn push_chunk(&mut self, state: &RuntimeState, page: Page) -> Result<(), String>;

    /// Pull the next output page. `Ok(None)` means no output is available
    /// right now; `is_finished` reports whether more can ever come.
    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Page>, String>;

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<(), String>;

    /// Dependency that must become ready before the next push/pull attempt
    /// can make progress. `None` means the operator is not blocked.
    fn blocked_dependency(&self) -> Option<DependencyHandle> {
        None
    }
}
